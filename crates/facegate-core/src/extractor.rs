//! Feature extractor contract and the worker thread that owns it.
//!
//! Extraction is compute-bound and extractors keep mutable state (model
//! sessions, scratch buffers), so a single extractor lives on a dedicated
//! OS thread. Async callers talk to it through a clone-safe
//! [`ExtractorHandle`] and never block the runtime.

use std::str::FromStr;
use std::time::Duration;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::types::FaceDetection;

const REQUEST_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn extractor thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("extractor thread exited")]
    ChannelClosed,
}

/// Maps a decoded colour image to zero or more face feature vectors.
///
/// Implementations must be deterministic: the same image yields the same
/// detections in the same order.
pub trait FeatureExtractor: Send + 'static {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, ExtractorError>;
}

/// Which face to use when an image contains more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceSelection {
    /// The first face the extractor reports.
    #[default]
    First,
    /// The face with the largest bounding box; earlier detections win ties.
    Largest,
}

impl FaceSelection {
    pub fn select(self, detections: Vec<FaceDetection>) -> Option<FaceDetection> {
        match self {
            Self::First => detections.into_iter().next(),
            Self::Largest => {
                let mut best: Option<FaceDetection> = None;
                for det in detections {
                    let larger = match &best {
                        None => true,
                        Some(b) => det.bounding_box.area() > b.bounding_box.area(),
                    };
                    if larger {
                        best = Some(det);
                    }
                }
                best
            }
        }
    }
}

impl FromStr for FaceSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "largest" => Ok(Self::Largest),
            other => Err(format!("unknown face selection policy '{other}' (expected first|largest)")),
        }
    }
}

struct ExtractRequest {
    image: RgbImage,
    reply: oneshot::Sender<Result<Vec<FaceDetection>, ExtractorError>>,
}

/// Clone-safe handle to the extractor thread.
#[derive(Clone)]
pub struct ExtractorHandle {
    tx: mpsc::Sender<ExtractRequest>,
    timeout: Duration,
}

impl ExtractorHandle {
    /// Run extraction on the worker thread.
    ///
    /// Dropping the returned future abandons the request; the worker's
    /// reply is then discarded.
    pub async fn extract(&self, image: RgbImage) -> Result<Vec<FaceDetection>, ExtractorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            self.tx
                .send(ExtractRequest { image, reply: reply_tx })
                .await
                .map_err(|_| ExtractorError::ChannelClosed)?;
            reply_rx.await.map_err(|_| ExtractorError::ChannelClosed)?
        };
        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| ExtractorError::Timeout(self.timeout))?
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Spawn the extractor on a dedicated OS thread.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_extractor<E: FeatureExtractor>(
    mut extractor: E,
    timeout: Duration,
) -> Result<ExtractorHandle, ExtractorError> {
    let (tx, mut rx) = mpsc::channel::<ExtractRequest>(REQUEST_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("facegate-extractor".into())
        .spawn(move || {
            tracing::info!("extractor thread started");
            while let Some(req) = rx.blocking_recv() {
                if req.reply.is_closed() {
                    tracing::debug!("skipping abandoned extraction request");
                    continue;
                }
                let (w, h) = req.image.dimensions();
                let result = extractor.extract(&req.image);
                match &result {
                    Ok(faces) => tracing::debug!(width = w, height = h, faces = faces.len(), "extracted"),
                    Err(err) => tracing::warn!(width = w, height = h, error = %err, "extraction error"),
                }
                let _ = req.reply.send(result);
            }
            tracing::info!("extractor thread exiting");
        })?;

    Ok(ExtractorHandle { tx, timeout })
}
