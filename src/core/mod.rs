pub mod model;
pub mod onnx;
pub mod synthetic;
pub mod types;

pub use model::{FaceModel, ModelHost};
pub use onnx::OnnxFaceModel;
pub use synthetic::BlobFaceModel;
pub use types::{cosine_similarity, FaceDescriptor, Frame, LandmarkSet, Point};
