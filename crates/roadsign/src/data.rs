use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};

use crate::{Error, preprocess};

/// Extensions recognised when splitting an annotation line into image and labels.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Marker some exporters prepend to lines they could not process.
const ERROR_MARKER: &str = "Error: ";

/// Minimum number of comma-separated label fields: `x1,y1,x2,y2,class_id`.
const MIN_LABEL_FIELDS: usize = 5;

/// One parsed line of an annotation file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// File name of the image, relative to the image directory.
    pub image_name: String,
    pub class_id: usize,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("no image path followed by labels")]
    MissingImage,

    #[error("expected at least 5 label fields, got {0}")]
    TooFewFields(usize),

    #[error("invalid class id `{0}`")]
    InvalidClassId(String),
}

/// Parses `<path>.<ext> x1,y1,x2,y2,class_id[ ...]`.
///
/// When several boxes are listed the class of the last one is used.
pub fn parse_annotation_line(line: &str) -> Result<Annotation, AnnotationError> {
    let line = line.trim();
    let line = line.strip_prefix(ERROR_MARKER).unwrap_or(line).trim();

    let (image_path, labels) = split_image_and_labels(line).ok_or(AnnotationError::MissingImage)?;

    let fields: Vec<&str> = labels.split(',').collect();
    if fields.len() < MIN_LABEL_FIELDS {
        return Err(AnnotationError::TooFewFields(fields.len()));
    }

    let raw_class = fields[fields.len() - 1].trim();
    let class_id = raw_class
        .parse::<usize>()
        .map_err(|_| AnnotationError::InvalidClassId(raw_class.to_string()))?;

    let image_name = Path::new(image_path)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or(AnnotationError::MissingImage)?
        .to_string();

    Ok(Annotation {
        image_name,
        class_id,
    })
}

/// Splits after the first `.<ext> ` so file names may contain spaces.
fn split_image_and_labels(line: &str) -> Option<(&str, &str)> {
    // ASCII lowercasing keeps byte offsets valid for the original line.
    let lower = line.to_ascii_lowercase();

    let end = IMAGE_EXTENSIONS
        .iter()
        .filter_map(|ext| {
            lower
                .find(&format!(".{ext} "))
                .map(|position| position + ext.len() + 1)
        })
        .min()?;

    let labels = line[end..].trim();
    if labels.is_empty() {
        return None;
    }

    Some((&line[..end], labels))
}

/// A decoded, resized training image with its class.
#[derive(Debug, Clone)]
pub struct TrafficSignItem {
    /// Interleaved RGB bytes, `[input_size, input_size, 3]`.
    pub image: Vec<u8>,
    pub label: usize,
    pub image_path: String,
}

/// Dataset described by an annotation file next to its images.
///
/// Images are decoded eagerly; lines or images that cannot be used are
/// logged and skipped instead of failing the whole load.
pub struct AnnotationDataset {
    dataset: InMemDataset<TrafficSignItem>,
    num_classes: usize,
}

impl Dataset<TrafficSignItem> for AnnotationDataset {
    fn get(&self, index: usize) -> Option<TrafficSignItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl AnnotationDataset {
    /// Loads `annotation_file`, resolving image names inside `image_dir`.
    pub fn load<P: AsRef<Path>, D: AsRef<Path>>(
        annotation_file: P,
        image_dir: D,
        input_size: usize,
    ) -> Result<Self, Error> {
        let annotation_file = annotation_file.as_ref();
        let content = std::fs::read_to_string(annotation_file)?;

        let annotations = parse_annotations(&content);
        let num_classes = annotations
            .iter()
            .map(|annotation| annotation.class_id + 1)
            .max()
            .unwrap_or(0);

        if num_classes == 0 {
            return Err(Error::EmptyDataset(annotation_file.to_path_buf()));
        }

        let items: Vec<TrafficSignItem> = annotations
            .into_iter()
            .filter_map(|annotation| load_item(image_dir.as_ref(), annotation, input_size))
            .collect();

        if items.is_empty() {
            return Err(Error::EmptyDataset(annotation_file.to_path_buf()));
        }

        log::info!(
            "Loaded {} images over {} classes from {}",
            items.len(),
            num_classes,
            annotation_file.display()
        );

        Ok(Self {
            dataset: InMemDataset::new(items),
            num_classes,
        })
    }

    /// Class count, `max(class_id) + 1` over the parsed annotations.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

fn parse_annotations(content: &str) -> Vec<Annotation> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(index, line)| match parse_annotation_line(line) {
            Ok(annotation) => Some(annotation),
            Err(err) => {
                log::warn!("Skipping annotation line {}: {err}: {}", index + 1, line.trim());
                None
            }
        })
        .collect()
}

fn load_item(image_dir: &Path, annotation: Annotation, input_size: usize) -> Option<TrafficSignItem> {
    let path: PathBuf = image_dir.join(&annotation.image_name);

    match preprocess::open_oriented(&path) {
        Ok(image) => Some(TrafficSignItem {
            image: preprocess::resize_rgb(&image, input_size),
            label: annotation.class_id,
            image_path: path.display().to_string(),
        }),
        Err(err) => {
            log::warn!("Skipping image {}: {err}", path.display());
            None
        }
    }
}

/// Builds a `[batch, 3, size, size]` tensor scaled to `[0, 1]` from interleaved RGB bytes.
pub fn images_to_tensor<B: Backend>(
    images: &[&[u8]],
    input_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let images = images
        .iter()
        .map(|pixels| TensorData::new(pixels.to_vec(), Shape::new([input_size, input_size, 3])))
        .map(|data| {
            Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), device)
                // [H, W, C] -> [C, H, W]
                .permute([2, 0, 1])
        })
        .map(|tensor| tensor / 255)
        .collect();

    Tensor::stack(images, 0)
}

#[derive(Clone, Debug)]
pub struct TrafficSignBatcher<B: Backend> {
    input_size: usize,
    _backend: PhantomData<B>,
}

#[derive(Clone, Debug)]
pub struct TrafficSignBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> TrafficSignBatcher<B> {
    pub fn new(input_size: usize) -> Self {
        Self {
            input_size,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, TrafficSignItem, TrafficSignBatch<B>> for TrafficSignBatcher<B> {
    fn batch(&self, items: Vec<TrafficSignItem>, device: &B::Device) -> TrafficSignBatch<B> {
        let pixels: Vec<&[u8]> = items.iter().map(|item| item.image.as_slice()).collect();
        let images = images_to_tensor(&pixels, self.input_size, device);

        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, [items.len()]).convert::<B::IntElem>(),
            device,
        );

        TrafficSignBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    type TestBackend = NdArray;

    #[test]
    fn parse_single_box_line() {
        let annotation = parse_annotation_line("train/stop_01.jpg 12,8,40,36,7").unwrap();

        assert_eq!(
            annotation,
            Annotation {
                image_name: "stop_01.jpg".to_string(),
                class_id: 7
            }
        );
    }

    #[test]
    fn parse_strips_error_marker() {
        let annotation = parse_annotation_line("Error: img 3.jpg 1,2,3,4,11").unwrap();

        assert_eq!(annotation.image_name, "img 3.jpg");
        assert_eq!(annotation.class_id, 11);
    }

    #[test]
    fn parse_uses_last_box_class() {
        let annotation = parse_annotation_line("a.png 1,2,3,4,5 6,7,8,9,2").unwrap();

        assert_eq!(annotation.class_id, 2);
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert_eq!(
            parse_annotation_line("no image here"),
            Err(AnnotationError::MissingImage)
        );
        assert_eq!(
            parse_annotation_line("a.jpg 1,2,3"),
            Err(AnnotationError::TooFewFields(3))
        );
        assert_eq!(
            parse_annotation_line("a.jpg 1,2,3,4,stop"),
            Err(AnnotationError::InvalidClassId("stop".to_string()))
        );
    }

    #[test]
    fn parse_annotations_skips_bad_lines() {
        let content = "a.jpg 1,2,3,4,0\nbroken\n\nb.jpg 1,2,3,4,4\nc.jpg 1,2\n";
        let annotations = parse_annotations(content);

        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[1].class_id, 4);
    }

    fn write_image(dir: &Path, name: &str, color: [u8; 3]) {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb(color)))
            .save_with_format(dir.join(name), ImageFormat::Jpeg)
            .unwrap();
    }

    #[test]
    fn load_dataset_skips_missing_images_and_counts_classes() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.jpg", [255, 0, 0]);
        write_image(dir.path(), "b.jpg", [0, 255, 0]);

        let annotations = dir.path().join("_annotations.txt");
        std::fs::write(
            &annotations,
            "a.jpg 0,0,10,10,0\nmissing.jpg 0,0,10,10,1\nbad line\nb.jpg 0,0,10,10,2\n",
        )
        .unwrap();

        let dataset = AnnotationDataset::load(&annotations, dir.path(), 30).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.num_classes(), 3);

        let item = dataset.get(1).unwrap();
        assert_eq!(item.label, 2);
        assert_eq!(item.image.len(), 30 * 30 * 3);
    }

    #[test]
    fn load_dataset_without_labels_fails() {
        let dir = tempfile::tempdir().unwrap();
        let annotations = dir.path().join("_annotations.txt");
        std::fs::write(&annotations, "nothing useful\n").unwrap();

        let result = AnnotationDataset::load(&annotations, dir.path(), 30);

        assert!(matches!(result, Err(Error::EmptyDataset(_))));
    }

    #[test]
    fn batcher_produces_channel_first_unit_range_images() {
        let device = Default::default();
        let size = 2;
        // Pixel (0, 0) is pure red, everything else black.
        let mut image = vec![0u8; size * size * 3];
        image[0] = 255;

        let items = vec![
            TrafficSignItem {
                image: image.clone(),
                label: 3,
                image_path: "a.jpg".to_string(),
            },
            TrafficSignItem {
                image,
                label: 1,
                image_path: "b.jpg".to_string(),
            },
        ];

        let batch = TrafficSignBatcher::<TestBackend>::new(size).batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(
            batch.targets.to_data().to_vec::<i64>().unwrap(),
            vec![3, 1]
        );

        let values = batch.images.to_data().to_vec::<f32>().unwrap();
        // Red channel of pixel (0, 0), then its green channel.
        assert_eq!(values[0], 1.0);
        assert_eq!(values[size * size], 0.0);
    }
}
