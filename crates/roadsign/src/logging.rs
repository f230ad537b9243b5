use std::{ffi::OsStr, path::Path};

use tracing_subscriber::{EnvFilter, prelude::*, registry};

/// Installs the global subscriber: stdout, plus a plain-text file when `file_path` is set.
///
/// `log` records are forwarded to the subscriber. The level defaults to `info`
/// and can be overridden with `RUST_LOG`. If a global subscriber is already
/// configured, nothing is changed.
pub fn install_logger(file_path: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    let file = file_path.map(|path| {
        let writer = tracing_appender::rolling::never(
            path.parent().unwrap_or_else(|| Path::new(".")),
            path.file_name().unwrap_or_else(|| OsStr::new("roadsign.log")),
        );
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
    });

    if registry().with(filter).with(stdout).with(file).try_init().is_ok() {
        if let Some(path) = file_path {
            update_panic_hook(path);
        }
    }
}

fn update_panic_hook(file_path: &Path) {
    let hook = std::panic::take_hook();
    let file_path = file_path.display().to_string();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        eprintln!(
            "=== PANIC ===\nA fatal error happened, you can check the logs here => \
             '{file_path}'\n============="
        );
        hook(info);
    }));
}
