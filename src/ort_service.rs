use crate::{
    config::ModelConfig,
    detection::{non_max_suppression, Detection, Detections},
    image_codec::{self, ImageCodecError},
    labels::ClassLabels,
    model_service::{DetectionModel, ModelError},
};
use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::{Array, ArrayViewD, Axis, Ix2, Ix4};
#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use once_cell::sync::OnceCell;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// Grey used by YOLO exporters for letterbox padding.
const PAD_VALUE: u8 = 114;

/// Where the original image sits inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    new_width: u32,
    new_height: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, input_size: u32) -> Self {
        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let new_width = ((width as f32 * scale).round() as u32).clamp(1, input_size);
        let new_height = ((height as f32 * scale).round() as u32).clamp(1, input_size);

        Self {
            scale,
            new_width,
            new_height,
            pad_x: (input_size - new_width) / 2,
            pad_y: (input_size - new_height) / 2,
        }
    }

    /// Maps a point in model input coordinates back onto the original image.
    fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Resizes keeping the aspect ratio, centres on a grey square and normalises to NCHW.
fn transform_image(img: &RgbImage, input_size: u32) -> (Array<f32, Ix4>, Letterbox) {
    let (width, height) = img.dimensions();
    let letterbox = Letterbox::fit(width, height, input_size);

    let resized = image::imageops::resize(
        img,
        letterbox.new_width,
        letterbox.new_height,
        FilterType::Triangle,
    );
    let mut canvas = RgbImage::from_pixel(input_size, input_size, Rgb([PAD_VALUE; 3]));
    image::imageops::replace(
        &mut canvas,
        &resized,
        letterbox.pad_x as i64,
        letterbox.pad_y as i64,
    );

    let size = input_size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    (input, letterbox)
}

fn check_class_count(labels: usize, outputs: usize) -> Result<(), ModelError> {
    if labels != outputs {
        return Err(ModelError::ClassCountMismatch { labels, outputs });
    }
    Ok(())
}

/// Decoding and filtering parameters for the raw `[1, 4 + classes, anchors]` output.
#[derive(Debug, Clone, Copy)]
struct OutputDecoder {
    input_size: u32,
    num_classes: Option<usize>,
    min_probability: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl OutputDecoder {
    fn from_config(config: &ModelConfig, labels: &ClassLabels) -> Self {
        Self {
            input_size: config.input_size,
            num_classes: (!labels.is_empty()).then(|| labels.len()),
            min_probability: config.min_probability,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        }
    }

    fn decode(
        &self,
        outputs: ArrayViewD<f32>,
        letterbox: Letterbox,
        img_width: u32,
        img_height: u32,
    ) -> Result<Vec<Detection>, ModelError> {
        if outputs.ndim() != 3 || outputs.shape()[0] != 1 || outputs.shape()[1] <= 4 {
            return Err(ModelError::Inference(format!(
                "unexpected output shape {:?}",
                outputs.shape()
            )));
        }
        if let Some(num_classes) = self.num_classes {
            check_class_count(num_classes, outputs.shape()[1] - 4)?;
        }
        let output = outputs
            .index_axis_move(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| ModelError::Inference(format!("invalid output shape: {}", e)))?;

        let mut boxes = Vec::new();
        for row in output.axis_iter(Axis(1)) {
            let Some((class_id, prob)) = row
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };

            if prob < self.min_probability {
                continue;
            }

            let (xc, yc, w, h) = (row[0], row[1], row[2], row[3]);
            let (x1, y1) = letterbox.to_original(xc - w / 2., yc - h / 2.);
            let (x2, y2) = letterbox.to_original(xc + w / 2., yc + h / 2.);

            boxes.push(
                Detection {
                    class_id,
                    confidence: prob,
                    x1,
                    y1,
                    x2,
                    y2,
                }
                .clamp_to(img_width, img_height),
            );
        }

        Ok(non_max_suppression(
            boxes,
            self.iou_threshold,
            self.max_detections,
        ))
    }
}

pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    labels: Arc<ClassLabels>,
    output_name: String,
    decoder: OutputDecoder,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelError> {
        model_config.validate().map_err(ModelError::WeightsNotFound)?;

        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| build_session(&model_config.get_path()))
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ModelError::Load(e.to_string()))?;

        let metadata_labels = labels_from_metadata(&sessions[0])?;
        let labels = match (&model_config.labels_file, metadata_labels) {
            (Some(labels_file), metadata_labels) => {
                let labels = ClassLabels::load(labels_file)?;
                if let Some(metadata_labels) = metadata_labels {
                    check_class_count(labels.len(), metadata_labels.len())?;
                }
                labels
            }
            (None, Some(metadata_labels)) => metadata_labels,
            (None, None) => {
                tracing::warn!("No labels file configured and no class names in model metadata");
                ClassLabels::default()
            }
        };

        tracing::info!(
            "Created {} ONNX sessions for {:?} with {} classes",
            num_instances,
            model_config.get_path(),
            labels.len()
        );

        Ok(Self {
            sessions: Arc::new(
                sessions
                    .into_iter()
                    .map(|session| Arc::new(Mutex::new(session)))
                    .collect(),
            ),
            counter: Arc::new(AtomicUsize::new(0)),
            decoder: OutputDecoder::from_config(model_config, &labels),
            labels: Arc::new(labels),
            output_name: model_config.output_name.clone(),
        })
    }

    pub fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let session_arc = &self.sessions[index];
        let mut session = session_arc
            .lock()
            .map_err(|e| ModelError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(format!("failed to extract tensor: {}", e)))?;

        let ix = shape.to_ixdyn();
        let array = ndarray::ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| ModelError::Inference(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }
}

impl DetectionModel for OrtModelService {
    fn predict(&self, image_path: &Path) -> Result<Detections, ModelError> {
        let orig_img = image_codec::load_image(image_path).map_err(|e| match e {
            ImageCodecError::Decode(e) => ModelError::ImageDecode(e.to_string()),
            other => ModelError::Inference(other.to_string()),
        })?;
        let (img_width, img_height) = orig_img.dimensions();

        let (input, letterbox) = transform_image(&orig_img, self.decoder.input_size);
        let outputs = self.run_inference(&input)?;
        let boxes = self
            .decoder
            .decode(outputs.view(), letterbox, img_width, img_height)?;

        Ok(Detections::new(boxes, self.labels.clone(), orig_img))
    }
}

fn build_session(model_path: &Path) -> Result<Session, ort::Error> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    #[cfg(feature = "tensorrt")]
    let builder = builder.with_execution_providers([TensorRTExecutionProvider::default()
        .with_engine_cache(true)
        .build()])?;
    builder.commit_from_file(model_path)
}

fn labels_from_metadata(session: &Session) -> Result<Option<ClassLabels>, ModelError> {
    let names = session
        .metadata()
        .and_then(|metadata| metadata.custom("names"))
        .map_err(|e| ModelError::Load(format!("failed to read model metadata: {}", e)))?;

    Ok(names
        .map(|names| ClassLabels::from_metadata(&names))
        .transpose()?)
}

/// The process-wide detector, constructed on first use.
///
/// Concurrent first callers block on the same initialisation. A failed load is
/// not cached, the next call tries again.
pub struct ModelHandle {
    config: ModelConfig,
    model: OnceCell<OrtModelService>,
}

impl ModelHandle {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            model: OnceCell::new(),
        }
    }

    pub fn ensure_loaded(&self) -> Result<&OrtModelService, ModelError> {
        self.model.get_or_try_init(|| {
            tracing::info!("Loading detection model from {:?}", self.config.get_path());
            OrtModelService::new(&self.config)
        })
    }
}

impl DetectionModel for ModelHandle {
    fn predict(&self, image_path: &Path) -> Result<Detections, ModelError> {
        self.ensure_loaded()?.predict(image_path)
    }

    fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use std::path::PathBuf;

    fn decoder() -> OutputDecoder {
        OutputDecoder {
            input_size: 640,
            num_classes: None,
            min_probability: 0.25,
            iou_threshold: 0.7,
            max_detections: 300,
        }
    }

    fn raw_output(anchors: &[[f32; 6]]) -> Array3<f32> {
        // Rows are xc, yc, w, h, score0, score1.
        let mut raw = Array3::<f32>::zeros((1, 6, anchors.len()));
        for (anchor, values) in anchors.iter().enumerate() {
            for (row, value) in values.iter().enumerate() {
                raw[[0, row, anchor]] = *value;
            }
        }
        raw
    }

    #[test]
    fn test_letterbox_fit() {
        let letterbox = Letterbox::fit(1280, 640, 640);
        assert_eq!(letterbox.scale, 0.5);
        assert_eq!((letterbox.new_width, letterbox.new_height), (640, 320));
        assert_eq!((letterbox.pad_x, letterbox.pad_y), (0, 160));

        let letterbox = Letterbox::fit(300, 600, 640);
        assert_eq!((letterbox.new_width, letterbox.new_height), (320, 640));
        assert_eq!((letterbox.pad_x, letterbox.pad_y), (160, 0));
    }

    #[test]
    fn test_transform_image() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));

        let (input, _) = transform_image(&img, 640);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((input[[0, 0, 320, 320]] - 1.).abs() < 1e-6);
        assert_eq!(input[[0, 1, 320, 320]], 0.);
        assert_eq!(input[[0, 2, 320, 320]], 0.);
    }

    #[test]
    fn test_transform_image_keeps_aspect_ratio() {
        let mut img = RgbImage::new(640, 320);
        for y in 100..200 {
            for x in 100..200 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let (input, letterbox) = transform_image(&img, 640);
        assert_eq!((letterbox.pad_x, letterbox.pad_y), (0, 160));

        let bright = |value: f32| value > 0.5;
        let square_width = (0..640).filter(|&x| bright(input[[0, 0, 160 + 150, x]])).count();
        let square_height = (0..640).filter(|&y| bright(input[[0, 0, y, 150]])).count();
        assert!((98..=102).contains(&square_width), "width {}", square_width);
        assert!((98..=102).contains(&square_height), "height {}", square_height);

        let grey = PAD_VALUE as f32 / 255.;
        assert!((input[[0, 0, 0, 0]] - grey).abs() < 1e-6);
        assert!((input[[0, 2, 639, 639]] - grey).abs() < 1e-6);
        assert!(input[[0, 0, 160, 0]] < 1e-6);
    }

    #[test]
    fn test_decode_output() {
        let raw = raw_output(&[
            [320., 320., 64., 64., 0.1, 0.9],
            [322., 322., 64., 64., 0.2, 0.8],
            [100., 200., 20., 20., 0.6, 0.1],
        ]);
        let letterbox = Letterbox::fit(1280, 640, 640);

        let boxes = decoder()
            .decode(raw.into_dyn().view(), letterbox, 1280, 640)
            .unwrap();

        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].class_id, 1);
        assert!((boxes[0].confidence - 0.9).abs() < 1e-6);
        assert!((boxes[0].x1 - 576.).abs() < 1e-3);
        assert!((boxes[0].y1 - 256.).abs() < 1e-3);
        assert!((boxes[0].x2 - 704.).abs() < 1e-3);
        assert!((boxes[0].y2 - 384.).abs() < 1e-3);
        // Square in the input, square in the original image.
        assert!(((boxes[0].x2 - boxes[0].x1) - (boxes[0].y2 - boxes[0].y1)).abs() < 1e-3);
        assert_eq!(boxes[1].class_id, 0);
        assert!((boxes[1].y1 - 60.).abs() < 1e-3);
    }

    #[test]
    fn test_decode_output_below_threshold() {
        let mut raw = Array3::<f32>::zeros((1, 5, 2));
        raw[[0, 4, 0]] = 0.1;
        raw[[0, 4, 1]] = 0.2;

        let boxes = decoder()
            .decode(raw.into_dyn().view(), Letterbox::fit(10, 10, 640), 10, 10)
            .unwrap();

        assert!(boxes.is_empty());
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let raw = Array3::<f32>::zeros((1, 4, 8));
        assert!(matches!(
            decoder().decode(raw.into_dyn().view(), Letterbox::fit(10, 10, 640), 10, 10),
            Err(ModelError::Inference(_))
        ));
    }

    #[test]
    fn test_decode_output_rejects_label_count_mismatch() {
        let raw = raw_output(&[[320., 320., 64., 64., 0.1, 0.9]]);
        let labels = ClassLabels::from_names(["glioma", "meningioma", "pituitary"]);
        let decoder = OutputDecoder::from_config(&model_config(), &labels);

        let result = decoder.decode(raw.into_dyn().view(), Letterbox::fit(640, 640, 640), 640, 640);

        assert!(matches!(
            result,
            Err(ModelError::ClassCountMismatch {
                labels: 3,
                outputs: 2
            })
        ));
    }

    #[test]
    fn test_decode_output_with_matching_labels() {
        let raw = raw_output(&[[320., 320., 64., 64., 0.1, 0.9]]);
        let labels = ClassLabels::from_names(["glioma", "meningioma"]);
        let decoder = OutputDecoder::from_config(&model_config(), &labels);

        let boxes = decoder
            .decode(raw.into_dyn().view(), Letterbox::fit(640, 640, 640), 640, 640)
            .unwrap();

        assert_eq!(boxes.len(), 1);
    }

    #[test]
    fn test_check_class_count() {
        assert!(check_class_count(4, 4).is_ok());
        assert!(matches!(
            check_class_count(4, 3),
            Err(ModelError::ClassCountMismatch {
                labels: 4,
                outputs: 3
            })
        ));
    }

    fn model_config() -> ModelConfig {
        ModelConfig {
            model_dir: PathBuf::from("/nonexistent"),
            onnx_file: "best.onnx".to_string(),
            labels_file: None,
            num_instances: 1,
            input_size: 640,
            output_name: "output0".to_string(),
            min_probability: 0.25,
            iou_threshold: 0.7,
            max_detections: 300,
            preload: false,
        }
    }

    #[test]
    fn test_missing_weights_are_not_cached() {
        let handle = ModelHandle::new(model_config());

        assert!(matches!(
            handle.ensure_loaded(),
            Err(ModelError::WeightsNotFound(_))
        ));
        assert!(!handle.is_loaded());
        assert!(handle.predict(Path::new("missing.jpg")).is_err());
    }
}
