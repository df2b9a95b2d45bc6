use std::io;
use std::path::{Path, PathBuf};

/// The text file the mirror module polls for the current label.
///
/// Every write replaces the whole file with exactly the label bytes.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, label: &str) -> io::Result<()> {
        std::fs::write(&self.path, label.as_bytes())?;
        tracing::debug!(path = %self.path.display(), label, "status file updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_exact_label_without_newline() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("sample.txt"));

        status.write("<Unknown Person>").unwrap();
        assert_eq!(std::fs::read(status.path()).unwrap(), b"<Unknown Person>");
    }

    #[test]
    fn test_write_replaces_longer_content() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("sample.txt"));

        status.write("<Unknown Person>").unwrap();
        status.write("ada").unwrap();
        assert_eq!(std::fs::read_to_string(status.path()).unwrap(), "ada");
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("absent").join("sample.txt"));
        assert!(status.write("ada").is_err());
    }
}
