use crate::common::{Config, FaceAuthError, Result};
use crate::core::model::FaceModel;
use crate::core::types::{FaceDescriptor, Frame, LandmarkSet, Point};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let area1 = (self.x2 - self.x1) * (self.y2 - self.y1);
        let area2 = (other.x2 - other.x1) * (other.y2 - other.y1);
        let union = area1 + area2 - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

fn build_session(environment: &Arc<Environment>, path: &Path, optimization_level: u32) -> Result<Session> {
    if !path.exists() {
        return Err(FaceAuthError::ModelLoad(format!("model not found at: {:?}", path)));
    }

    let opt_level = match optimization_level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    };

    SessionBuilder::new(environment)
        .and_then(|b| b.with_optimization_level(opt_level))
        .and_then(|b| b.with_model_from_file(path))
        .map_err(|e| FaceAuthError::ModelLoad(format!("failed to load {:?}: {}", path, e)))
}

fn gray_to_tensor(img: &DynamicImage, channels: usize, scale: f32, offset: f32) -> Array4<f32> {
    let gray = img.to_luma8();
    let width = gray.width() as usize;
    let height = gray.height() as usize;
    let raw = gray.as_raw();
    let mut array = Array4::<f32>::zeros((1, channels, height, width));

    for y in 0..height {
        let row_offset = y * width;
        for x in 0..width {
            let value = (raw[row_offset + x] as f32 - offset) * scale;
            for c in 0..channels {
                array[[0, c, y, x]] = value;
            }
        }
    }

    array
}

fn first_output(session: &Session, input: Array4<f32>) -> Result<Vec<f32>> {
    let cow_array = CowArray::from(input.into_dyn());
    let input_tensor = Value::from_array(session.allocator(), &cow_array)?;
    let outputs = session.run(vec![input_tensor])?;
    let output = outputs
        .first()
        .ok_or_else(|| FaceAuthError::Model("model produced no outputs".into()))?;
    Ok(output.try_extract::<f32>()?.view().iter().copied().collect())
}

/// YOLO-style single-class face detector.
pub struct FaceDetector {
    session: Session,
    input_width: u32,
    input_height: u32,
    confidence: f32,
}

impl FaceDetector {
    pub fn new(environment: &Arc<Environment>, config: &Config) -> Result<Self> {
        let session = build_session(
            environment,
            &config.models.detector_path,
            config.models.optimization_level,
        )?;
        Ok(Self {
            session,
            input_width: config.detector.input_width,
            input_height: config.detector.input_height,
            confidence: config.detector.confidence,
        })
    }

    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let input = if image.width() == self.input_width && image.height() == self.input_height {
            gray_to_tensor(image, 3, 1.0 / 255.0, 0.0)
        } else {
            let resized = image.resize_exact(self.input_width, self.input_height, FilterType::Nearest);
            gray_to_tensor(&resized, 3, 1.0 / 255.0, 0.0)
        };

        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;
        let output = outputs
            .first()
            .ok_or_else(|| FaceAuthError::Model("detector produced no outputs".into()))?
            .try_extract::<f32>()?
            .view()
            .to_owned();
        let shape = output.shape().to_vec();
        let values: Vec<f32> = output.iter().copied().collect();

        let mut faces = self.parse_detections(&values, &shape);

        let scale_x = orig_width / self.input_width as f32;
        let scale_y = orig_height / self.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }

    // Output is [1, N, 5] or transposed [1, 5, N]: cx, cy, w, h, score.
    fn parse_detections(&self, output: &[f32], shape: &[usize]) -> Vec<FaceBox> {
        let (num_predictions, prediction_length, is_transposed) = match shape.len() {
            3 if shape[2] > shape[1] && shape[1] <= 10 => (shape[2], shape[1], true),
            3 => (shape[1], shape[2], false),
            2 => (shape[0], shape[1], false),
            _ => {
                tracing::warn!("Unexpected detector output shape: {:?}", shape);
                return Vec::new();
            }
        };
        if prediction_length < 5 || output.len() < num_predictions * prediction_length {
            tracing::warn!("Detector output too short for shape {:?}", shape);
            return Vec::new();
        }

        let at = |i: usize, field: usize| {
            if is_transposed {
                output[field * num_predictions + i]
            } else {
                output[i * prediction_length + field]
            }
        };

        let mut faces = Vec::new();
        for i in 0..num_predictions {
            let confidence = at(i, 4);
            if confidence <= 0.001 {
                continue;
            }
            let (mut cx, mut cy, mut w, mut h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
            // Normalized coordinates come back in [0, 1].
            if cx <= 1.0 && cy <= 1.0 && w <= 1.0 && h <= 1.0 {
                cx *= self.input_width as f32;
                w *= self.input_width as f32;
                cy *= self.input_height as f32;
                h *= self.input_height as f32;
            }

            let x1 = (cx - w / 2.0).max(0.0);
            let y1 = (cy - h / 2.0).max(0.0);
            let x2 = (cx + w / 2.0).min(self.input_width as f32);
            let y2 = (cy + h / 2.0).min(self.input_height as f32);

            if x2 - x1 > 10.0 && y2 - y1 > 10.0 {
                faces.push(FaceBox { x1, y1, x2, y2, confidence });
            }
        }

        let mut faces = apply_nms(faces, 0.45);
        faces.retain(|face| face.confidence >= self.confidence);
        faces.truncate(5);
        faces
    }
}

fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| kept.iou(&candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Regresses 68 points from a square face crop.
pub struct LandmarkPredictor {
    session: Session,
    input_size: u32,
}

impl LandmarkPredictor {
    pub fn new(environment: &Arc<Environment>, config: &Config) -> Result<Self> {
        let session = build_session(
            environment,
            &config.models.landmark_path,
            config.models.optimization_level,
        )?;
        Ok(Self { session, input_size: config.landmarks.input_size })
    }

    pub fn predict(&self, image: &DynamicImage, face: &FaceBox) -> Result<LandmarkSet> {
        let (x, y, side) = square_crop(face, image.width(), image.height());
        let crop = image
            .crop_imm(x, y, side, side)
            .resize_exact(self.input_size, self.input_size, FilterType::Triangle);

        let raw = first_output(&self.session, gray_to_tensor(&crop, 1, 1.0 / 255.0, 0.0))?;
        if raw.len() < LandmarkSet::POINT_COUNT * 2 {
            return Err(FaceAuthError::Model(format!(
                "landmark model returned {} values, expected {}",
                raw.len(),
                LandmarkSet::POINT_COUNT * 2
            )));
        }

        // Coordinates are normalized to the crop.
        let points = raw
            .chunks_exact(2)
            .take(LandmarkSet::POINT_COUNT)
            .map(|xy| Point::new(x as f32 + xy[0] * side as f32, y as f32 + xy[1] * side as f32))
            .collect();
        LandmarkSet::new(points, face.confidence)
    }
}

fn square_crop(face: &FaceBox, width: u32, height: u32) -> (u32, u32, u32) {
    let cx = (face.x1 + face.x2) / 2.0;
    let cy = (face.y1 + face.y2) / 2.0;
    let side = (face.x2 - face.x1).max(face.y2 - face.y1).max(1.0);
    let side = (side as u32).min(width).min(height).max(1);
    let x = (cx - side as f32 / 2.0).max(0.0) as u32;
    let y = (cy - side as f32 / 2.0).max(0.0) as u32;
    (x.min(width - side), y.min(height - side), side)
}

pub struct FaceRecognizer {
    session: Session,
    input_size: u32,
    normalization_value: f32,
}

impl FaceRecognizer {
    pub fn new(environment: &Arc<Environment>, config: &Config) -> Result<Self> {
        let session = build_session(
            environment,
            &config.models.recognizer_path,
            config.models.optimization_level,
        )?;
        Ok(Self {
            session,
            input_size: config.recognizer.input_size,
            normalization_value: config.recognizer.normalization_value,
        })
    }

    pub fn get_embedding(&self, image: &DynamicImage, landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
        let (x1, y1, x2, y2) = landmarks.bbox();
        let margin = 0.1 * (x2 - x1).max(y2 - y1);
        let face = FaceBox {
            x1: (x1 - margin).max(0.0),
            y1: (y1 - margin).max(0.0),
            x2: x2 + margin,
            y2: y2 + margin,
            confidence: landmarks.confidence,
        };
        let (x, y, side) = square_crop(&face, image.width(), image.height());
        let crop = image
            .crop_imm(x, y, side, side)
            .resize_exact(self.input_size, self.input_size, FilterType::Triangle);

        // ArcFace normalization
        let norm = self.normalization_value;
        let embedding = first_output(&self.session, gray_to_tensor(&crop, 1, 1.0 / norm, norm))?;
        Ok(FaceDescriptor(embedding))
    }
}

/// Detector, landmark and recognizer sessions sharing one ONNX environment.
pub struct OnnxFaceModel {
    detector: FaceDetector,
    landmarks: LandmarkPredictor,
    recognizer: FaceRecognizer,
    _environment: Arc<Environment>,
}

impl OnnxFaceModel {
    pub fn load(config: &Config) -> Result<Self> {
        for path in [
            &config.models.detector_path,
            &config.models.landmark_path,
            &config.models.recognizer_path,
        ] {
            if !path.exists() {
                return Err(FaceAuthError::ModelLoad(format!("model not found at: {:?}", path)));
            }
        }

        let environment = Arc::new(
            Environment::builder()
                .with_name("faceguard")
                .build()
                .map_err(|e| FaceAuthError::ModelLoad(format!("Failed to create environment: {}", e)))?,
        );

        let detector = FaceDetector::new(&environment, config)?;
        let landmarks = LandmarkPredictor::new(&environment, config)?;
        let recognizer = FaceRecognizer::new(&environment, config)?;
        tracing::debug!(
            detector = %config.models.detector_path.display(),
            landmarks = %config.models.landmark_path.display(),
            recognizer = %config.models.recognizer_path.display(),
            "ONNX sessions ready"
        );

        Ok(Self { detector, landmarks, recognizer, _environment: environment })
    }
}

impl FaceModel for OnnxFaceModel {
    fn detect(&self, frame: &Frame) -> Result<Vec<LandmarkSet>> {
        let image = frame.to_image()?;
        self.detector
            .detect(&image)?
            .iter()
            .map(|face| self.landmarks.predict(&image, face))
            .collect()
    }

    fn encode(&self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
        let image = frame.to_image()?;
        self.recognizer.get_embedding(&image, landmarks)
    }
}
