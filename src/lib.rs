pub mod camera;
pub mod common;
pub mod core;
pub mod liveness;
pub mod pipeline;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, DevMode, FaceAuthError, Result, SecurityLevel};
pub use core::{cosine_similarity, FaceDescriptor, FaceModel, Frame, LandmarkSet, ModelHost};
pub use liveness::{LivenessEngine, LivenessVerdict};
pub use pipeline::FramePipeline;
pub use service::{protocol, IpcClient, IpcServer};
