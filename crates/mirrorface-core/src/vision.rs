//! The vision capability the recognition loop depends on.
//!
//! `Vision` is the seam between the loop and the models: image loading, face
//! detection, embedding extraction and the match decision. `OnnxVision` backs
//! it with SCRFD + ArcFace; tests substitute their own implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("cannot load image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

pub trait Vision {
    /// Decode an image file into RGB.
    fn load_image(&self, path: &Path) -> Result<RgbImage, VisionError> {
        image::open(path)
            .map(|img| img.into_rgb8())
            .map_err(|source| VisionError::Image {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Detect faces, highest confidence first.
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, VisionError>;

    /// One embedding per face, in the order of `faces`.
    fn extract_embeddings(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, VisionError>;

    /// Whether `candidate` is the same person as `reference`.
    fn compare(&self, reference: &Embedding, candidate: &Embedding) -> bool {
        reference.matches(candidate)
    }
}

/// SCRFD + ArcFace running on ONNX Runtime.
pub struct OnnxVision {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxVision {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, VisionError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl Vision for OnnxVision {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, VisionError> {
        Ok(self.detector.detect(image)?)
    }

    fn extract_embeddings(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, VisionError> {
        faces
            .iter()
            .map(|face| self.recognizer.extract(image, face).map_err(VisionError::from))
            .collect()
    }
}

/// `$XDG_DATA_HOME/mirrorface/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("mirrorface")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct NoModels;

    impl Vision for NoModels {
        fn detect_faces(&mut self, _: &RgbImage) -> Result<Vec<BoundingBox>, VisionError> {
            Ok(Vec::new())
        }

        fn extract_embeddings(
            &mut self,
            _: &RgbImage,
            _: &[BoundingBox],
        ) -> Result<Vec<Embedding>, VisionError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_load_image_decodes_png_to_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        RgbImage::from_pixel(8, 6, Rgb([1, 2, 3])).save(&path).unwrap();

        let image = NoModels.load_image(&path).unwrap();
        assert_eq!(image.dimensions(), (8, 6));
        assert_eq!(image.get_pixel(0, 0).0, [1, 2, 3]);
    }

    #[test]
    fn test_load_image_missing_file() {
        let err = NoModels.load_image(Path::new("/nonexistent/face.png")).unwrap_err();
        assert!(matches!(err, VisionError::Image { .. }));
    }

    #[test]
    fn test_default_compare_uses_match_threshold() {
        let reference = Embedding { values: vec![1.0, 0.0] };
        let same = Embedding { values: vec![0.9, 0.1] };
        let other = Embedding { values: vec![0.0, 1.0] };
        assert!(NoModels.compare(&reference, &same));
        assert!(!NoModels.compare(&reference, &other));
    }

    #[test]
    fn test_onnx_vision_requires_models() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxVision::load(dir.path()).err().unwrap();
        assert!(matches!(
            err,
            VisionError::Detector(DetectorError::ModelNotFound(_))
        ));
    }
}
