//! Image decoding and resizing shared by training and inference.
//!
//! Pixels are kept as interleaved RGB bytes (`[height, width, 3]`) until they
//! are batched; see [`crate::data::images_to_tensor`] for the channel-first
//! conversion.

use std::{io::Cursor, path::Path};

use image::{
    DynamicImage, ImageDecoder, ImageReader, imageops::FilterType, metadata::Orientation,
};

use crate::Error;

/// Decodes an encoded image and applies its EXIF orientation.
///
/// Camera photos often store the sensor orientation as metadata instead of
/// rotating the pixels. A missing or unreadable orientation tag leaves the
/// image untouched.
pub fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage, Error> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;

    let orientation = match decoder.orientation() {
        Ok(orientation) => orientation,
        Err(err) => {
            log::debug!("Ignoring unreadable orientation metadata: {err}");
            Orientation::NoTransforms
        }
    };

    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    Ok(image)
}

/// Reads an image file and applies its EXIF orientation.
pub fn open_oriented<P: AsRef<Path>>(path: P) -> Result<DynamicImage, Error> {
    let bytes = std::fs::read(path.as_ref())?;
    decode_oriented(&bytes)
}

/// Applies the transform encoded by an EXIF orientation value (1 to 8).
///
/// Unknown values leave the image unchanged.
pub fn apply_exif_orientation(mut image: DynamicImage, value: u8) -> DynamicImage {
    if let Some(orientation) = Orientation::from_exif(value) {
        image.apply_orientation(orientation);
    }
    image
}

/// Converts to RGB and resizes to `size × size` with a bilinear filter.
///
/// Returns the interleaved `[size, size, 3]` bytes.
pub fn resize_rgb(image: &DynamicImage, size: usize) -> Vec<u8> {
    let size = size as u32;
    let rgb = image.to_rgb8();

    image::imageops::resize(&rgb, size, size, FilterType::Triangle).into_raw()
}
