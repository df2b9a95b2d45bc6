//! Reference enrollment and identity-label discovery.

use crate::types::EnrolledIdentity;
use crate::vision::{Vision, VisionError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name suffix that marks an identity file, e.g. `ada-id.png`.
pub const IDENTITY_FILE_SUFFIX: &str = "-id.png";

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face found in reference image {}", .0.display())]
    NoFaceInReference(PathBuf),
    #[error("reference image {}: {source}", path.display())]
    Vision {
        path: PathBuf,
        #[source]
        source: VisionError,
    },
}

/// Build the enrolled identity from the reference image.
///
/// Uses the highest-confidence face when the reference holds several.
pub fn enroll<V: Vision>(
    vision: &mut V,
    reference: &Path,
) -> Result<EnrolledIdentity, EnrollError> {
    let wrap = |source| EnrollError::Vision {
        path: reference.to_path_buf(),
        source,
    };

    let image = vision.load_image(reference).map_err(wrap)?;
    let faces = vision.detect_faces(&image).map_err(wrap)?;
    let Some(face) = faces.first() else {
        return Err(EnrollError::NoFaceInReference(reference.to_path_buf()));
    };
    if faces.len() > 1 {
        tracing::warn!(
            path = %reference.display(),
            faces = faces.len(),
            "reference image holds several faces, enrolling the most confident"
        );
    }

    let embedding = vision
        .extract_embeddings(&image, std::slice::from_ref(face))
        .map_err(wrap)?
        .into_iter()
        .next()
        .ok_or_else(|| EnrollError::NoFaceInReference(reference.to_path_buf()))?;

    tracing::info!(
        path = %reference.display(),
        confidence = face.confidence,
        "enrolled reference face"
    );
    Ok(EnrolledIdentity::new(embedding))
}

/// Find the identity label named by a `*-id.png` file in `dir`.
///
/// The label is the part of the file name before the first `-` or space.
/// Files are visited in name order and the first non-empty label wins.
pub fn discover_label(dir: &Path) -> io::Result<Option<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(IDENTITY_FILE_SUFFIX))
        .collect();
    names.sort();

    Ok(names.iter().find_map(|name| label_from_file_name(name)))
}

fn label_from_file_name(name: &str) -> Option<String> {
    let label = name.split(['-', ' ']).next().unwrap_or_default();
    (!label.is_empty()).then(|| label.to_string())
}
