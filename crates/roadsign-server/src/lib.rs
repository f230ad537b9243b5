//! HTTP inference service for the roadsign classifier.
//!
//! - `POST /predict`: multipart form with a `file` field holding an encoded image.
//! - `GET /health`: liveness and the number of classes served.

mod error;

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State},
    routing::{get, post},
};
use burn::prelude::Backend;
use roadsign::{Classifier, Prediction};
use serde::Serialize;

pub use error::ApiError;

/// Field of the multipart form carrying the image.
pub const FILE_FIELD: &str = "file";
/// Camera photos easily exceed axum's default 2 MB body limit.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Shared server state: one classifier, one prediction at a time.
pub struct AppState<B: Backend> {
    classifier: Arc<Mutex<Classifier<B>>>,
    num_classes: usize,
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            classifier: self.classifier.clone(),
            num_classes: self.num_classes,
        }
    }
}

impl<B: Backend> AppState<B> {
    pub fn new(classifier: Classifier<B>) -> Self {
        let num_classes = classifier.labels().len();
        Self {
            classifier: Arc::new(Mutex::new(classifier)),
            num_classes,
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    classes: usize,
}

pub fn router<B: Backend>(state: AppState<B>) -> Router {
    Router::new()
        .route("/predict", post(predict::<B>))
        .route("/health", get(health::<B>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Binds `address` and serves until ctrl-c.
pub async fn serve<B: Backend>(
    state: AppState<B>,
    address: impl tokio::net::ToSocketAddrs,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Unable to listen for the shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}

async fn health<B: Backend>(State(state): State<AppState<B>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        classes: state.num_classes,
    })
}

async fn predict<B: Backend>(
    State(state): State<AppState<B>>,
    mut multipart: Multipart,
) -> Result<Json<Prediction>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?;
        upload = Some((file_name, bytes));
        break;
    }

    let (file_name, bytes) = upload.ok_or(ApiError::NoFilePart)?;
    if file_name.is_empty() || bytes.is_empty() {
        return Err(ApiError::NoSelectedFile);
    }
    log::debug!("Received {file_name} ({} bytes)", bytes.len());

    let classifier = state.classifier.clone();
    let prediction = tokio::task::spawn_blocking(move || {
        let classifier = classifier
            .lock()
            .map_err(|_| ApiError::Internal("The classifier lock is poisoned".into()))?;
        classifier.predict_bytes(&bytes).map_err(ApiError::from)
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))??;

    log::info!(
        "{file_name}: {} ({:.2})",
        prediction.label,
        prediction.confidence
    );
    Ok(Json(prediction))
}
