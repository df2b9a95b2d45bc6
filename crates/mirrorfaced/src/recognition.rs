//! The recognition loop: capture, detect, match, publish.
//!
//! Runs as a single task. Capture, inference and status writes are synchronous
//! calls; the only awaits are the retry and cooldown waits, which end early
//! once shutdown is requested.

use crate::retry::RetryPolicy;
use crate::status::StatusFile;
use image::RgbImage;
use mirrorface_core::identity::{self, EnrollError};
use mirrorface_core::{Embedding, EnrolledIdentity, Vision, VisionError};
use mirrorface_core::{DEFAULT_IDENTITY_LABEL, UNKNOWN_LABEL};
use mirrorface_hw::{FrameSource, SourceError, SourceGuard};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("video source: {0}")]
    Source(#[from] SourceError),
    #[error("vision models: {0}")]
    Vision(#[from] VisionError),
    #[error("enrollment: {0}")]
    Enroll(#[from] EnrollError),
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("no frame after {attempts} consecutive capture attempts")]
    CaptureExhausted { attempts: u32 },
    #[error("cannot write status file {}: {source}", path.display())]
    Status {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything the loop needs besides the source and the models.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub reference_image: PathBuf,
    pub identity_dir: PathBuf,
    pub status: StatusFile,
    pub retry: RetryPolicy,
    pub cooldown: Duration,
    pub label_refresh: bool,
}

/// Mutable state owned by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    /// Label shown for the enrolled face.
    pub display_label: String,
    pub last_written: Option<String>,
    pub cycles: u64,
    pub frames_captured: u64,
    pub labels_written: u64,
    pub consecutive_failures: u32,
}

impl LoopState {
    fn new(display_label: String) -> Self {
        Self {
            display_label,
            last_written: None,
            cycles: 0,
            frames_captured: 0,
            labels_written: 0,
            consecutive_failures: 0,
        }
    }
}

pub struct RecognitionLoop<S: FrameSource, V: Vision> {
    source: SourceGuard<S>,
    vision: V,
    identity: EnrolledIdentity,
    settings: LoopSettings,
    state: LoopState,
}

impl<S: FrameSource, V: Vision> RecognitionLoop<S, V> {
    /// Acquire the source, load the models and enroll the reference face.
    ///
    /// The source is released again if any later step fails.
    pub fn start<F>(source: S, load_vision: F, settings: LoopSettings) -> Result<Self, StartupError>
    where
        F: FnOnce() -> Result<V, VisionError>,
    {
        let source = SourceGuard::acquire(source)?;
        let mut vision = load_vision()?;

        let identity = identity::enroll(&mut vision, &settings.reference_image)?;
        let label = initial_label(&settings.identity_dir);

        Ok(Self {
            source,
            vision,
            identity,
            state: LoopState::new(label),
            settings,
        })
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Run until shutdown is requested or an unrecoverable error occurs.
    ///
    /// The source is released exactly once on return, whatever the outcome.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<LoopState, LoopError> {
        tracing::info!(
            label = %self.state.display_label,
            status_file = %self.settings.status.path().display(),
            "recognition loop running"
        );

        loop {
            tokio::task::yield_now().await;
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            self.state.cycles += 1;

            let Some(frame) = self.source.capture_frame() else {
                self.state.consecutive_failures += 1;
                let failures = self.state.consecutive_failures;
                if self.settings.retry.exhausted(failures) {
                    tracing::error!(failures, "capture retries exhausted");
                    return Err(LoopError::CaptureExhausted { attempts: failures });
                }
                let delay = self.settings.retry.delay_for(failures);
                tracing::warn!(failures, delay_ms = delay.as_millis() as u64, "no frame, retrying");
                if wait_or_shutdown(&mut shutdown, delay).await {
                    break;
                }
                continue;
            };
            self.state.consecutive_failures = 0;
            self.state.frames_captured += 1;

            let embeddings = match self.recognize(frame.image()) {
                Ok(embeddings) => embeddings,
                Err(err) => {
                    tracing::warn!(error = %err, sequence = frame.sequence, "face recognition failed");
                    if wait_or_shutdown(&mut shutdown, self.settings.retry.base_delay()).await {
                        break;
                    }
                    continue;
                }
            };
            if embeddings.is_empty() {
                continue;
            }

            if self.settings.label_refresh {
                self.refresh_label();
            }

            if self.publish(&embeddings, &mut shutdown).await? {
                break;
            }
        }

        tracing::info!(
            cycles = self.state.cycles,
            frames = self.state.frames_captured,
            labels = self.state.labels_written,
            "recognition loop stopped"
        );
        Ok(self.state)
    }

    fn recognize(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, VisionError> {
        let faces = self.vision.detect_faces(image)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(faces = faces.len(), "faces detected");
        self.vision.extract_embeddings(image, &faces)
    }

    fn refresh_label(&mut self) {
        match identity::discover_label(&self.settings.identity_dir) {
            Ok(Some(label)) if label != self.state.display_label => {
                tracing::info!(from = %self.state.display_label, to = %label, "identity label changed");
                self.state.display_label = label;
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(
                dir = %self.settings.identity_dir.display(),
                error = %err,
                "cannot scan identity directory, keeping label"
            ),
        }
    }

    /// Write the label of each face, hold it for the cooldown, then restore the
    /// display label. Returns `true` if shutdown interrupted a cooldown.
    async fn publish(
        &mut self,
        embeddings: &[Embedding],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, LoopError> {
        for embedding in embeddings {
            let resolved = if self.vision.compare(self.identity.embedding(), embedding) {
                self.state.display_label.clone()
            } else {
                UNKNOWN_LABEL.to_string()
            };
            tracing::info!(label = %resolved, "face recognized");
            self.write_label(&resolved)?;

            if wait_or_shutdown(shutdown, self.settings.cooldown).await {
                return Ok(true);
            }
            let display = self.state.display_label.clone();
            self.write_label(&display)?;
        }
        Ok(false)
    }

    fn write_label(&mut self, label: &str) -> Result<(), LoopError> {
        self.settings
            .status
            .write(label)
            .map_err(|source| LoopError::Status {
                path: self.settings.status.path().to_path_buf(),
                source,
            })?;
        self.state.labels_written += 1;
        self.state.last_written = Some(label.to_string());
        Ok(())
    }
}

fn initial_label(identity_dir: &Path) -> String {
    match identity::discover_label(identity_dir) {
        Ok(Some(label)) => label,
        Ok(None) => DEFAULT_IDENTITY_LABEL.to_string(),
        Err(err) => {
            tracing::warn!(
                dir = %identity_dir.display(),
                error = %err,
                "cannot scan identity directory, using default label"
            );
            DEFAULT_IDENTITY_LABEL.to_string()
        }
    }
}

/// Sleep for `delay` unless shutdown is requested first. Returns `true` on shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    tokio::select! {
        _ = &mut sleep => return false,
        requested = shutdown.wait_for(|stop| *stop) => {
            if requested.is_ok() {
                return true;
            }
        }
    }
    // Sender gone: nobody can request shutdown any more.
    sleep.await;
    false
}
