//! mirrorface-core — Face detection, recognition and enrollment.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition,
//! both running via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod detector;
pub mod identity;
pub mod recognizer;
pub mod types;
pub mod vision;

pub use identity::{discover_label, enroll, EnrollError};
pub use types::{
    BoundingBox, Embedding, EnrolledIdentity, DEFAULT_IDENTITY_LABEL, MATCH_THRESHOLD,
    UNKNOWN_LABEL,
};
pub use vision::{default_model_dir, OnnxVision, Vision, VisionError};
