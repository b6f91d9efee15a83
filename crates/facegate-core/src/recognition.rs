//! Recognition: captured image → probe → gallery match → authenticated identity.

use std::sync::Arc;

use chrono::Utc;
use image::RgbImage;
use thiserror::Error;
use tracing::Instrument;

use crate::extractor::{ExtractorHandle, FaceSelection};
use crate::matcher::{Matcher, Tolerance};
use crate::store::{EncodingStore, StoreError};
use crate::types::{AuthenticatedIdentity, Rejection, RequestContext};

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("no face detected in the capture")]
    NoFaceDetected,
    /// The reason is for logs and metrics; callers show one uniform message.
    #[error("face not recognized")]
    NotRecognized(Rejection),
    #[error("embedding dimension mismatch: gallery holds {expected}, probe has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("face extraction failed")]
    ExtractionFailed,
    #[error("encoding store unavailable")]
    StoreUnavailable,
}

impl RecognizeError {
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::NotRecognized(reason) => Some(*reason),
            _ => None,
        }
    }
}

pub struct RecognitionService {
    store: Arc<dyn EncodingStore>,
    extractor: ExtractorHandle,
    matcher: Arc<dyn Matcher + Send + Sync>,
    tolerance: Tolerance,
    selection: FaceSelection,
}

impl RecognitionService {
    pub fn new(
        store: Arc<dyn EncodingStore>,
        extractor: ExtractorHandle,
        matcher: Arc<dyn Matcher + Send + Sync>,
        tolerance: Tolerance,
        selection: FaceSelection,
    ) -> Self {
        Self {
            store,
            extractor,
            matcher,
            tolerance,
            selection,
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    /// Authenticate whoever is in `image`. All-or-nothing: either the full
    /// identity comes back or nothing about the gallery does.
    pub async fn recognize(
        &self,
        ctx: &RequestContext,
        image: RgbImage,
    ) -> Result<AuthenticatedIdentity, RecognizeError> {
        let span = tracing::info_span!(
            "recognize",
            request_id = %ctx.request_id,
            client = ctx.client.as_deref().unwrap_or("-"),
        );
        async move {
            let detections = self.extractor.extract(image).await.map_err(|err| {
                tracing::warn!(error = %err, "extractor failed during recognition");
                RecognizeError::ExtractionFailed
            })?;
            let probe = self
                .selection
                .select(detections)
                .ok_or(RecognizeError::NoFaceDetected)?
                .embedding;

            let gallery = self.store.all_signatures().await.map_err(map_store_error)?;
            if let Some(first) = gallery.first() {
                let expected = first.embedding.dimension();
                if expected != probe.dimension() {
                    tracing::error!(
                        expected,
                        actual = probe.dimension(),
                        "probe dimension differs from gallery: check extractor version"
                    );
                    return Err(RecognizeError::DimensionMismatch {
                        expected,
                        actual: probe.dimension(),
                    });
                }
            }

            let result = self.matcher.compare(&probe, &gallery, self.tolerance);
            let identity_id = match (result.identity_id, result.rejection()) {
                (Some(id), None) => id,
                (_, reason) => {
                    let reason = reason.unwrap_or(Rejection::EmptyGallery);
                    tracing::info!(
                        gallery = gallery.len(),
                        %reason,
                        tolerance = %self.tolerance,
                        "face not recognized"
                    );
                    return Err(RecognizeError::NotRecognized(reason));
                }
            };

            let identity = match self.store.identity(identity_id).await {
                Ok(identity) => identity,
                Err(StoreError::IdentityNotFound(_)) => {
                    tracing::info!(identity = %identity_id, "matched identity removed before resolution");
                    return Err(RecognizeError::NotRecognized(Rejection::ToleranceExceeded {
                        best_distance: result.distance.unwrap_or(f32::INFINITY),
                    }));
                }
                Err(err) => return Err(map_store_error(err)),
            };

            tracing::info!(
                identity = %identity.id,
                account = %identity.account,
                distance = result.distance.unwrap_or_default(),
                gallery = gallery.len(),
                "face recognized"
            );
            Ok(AuthenticatedIdentity {
                identity,
                request_id: ctx.request_id,
                authenticated_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

fn map_store_error(err: StoreError) -> RecognizeError {
    tracing::warn!(error = %err, "encoding store failure during recognition");
    RecognizeError::StoreUnavailable
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::enrollment::{EnrollRequest, EnrollmentService};
    use crate::extractor::spawn_extractor;
    use crate::extractor::testing::{image_of, PixelExtractor};
    use crate::matcher::EuclideanMatcher;
    use crate::store::MemoryStore;
    use crate::types::Identity;

    struct Fixture {
        store: Arc<MemoryStore>,
        enrollment: EnrollmentService,
        recognition: RecognitionService,
    }

    fn fixture(tolerance: f32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_extractor(PixelExtractor, Duration::from_secs(5)).unwrap();
        Fixture {
            store: store.clone(),
            enrollment: EnrollmentService::new(store.clone(), handle.clone(), FaceSelection::First),
            recognition: RecognitionService::new(
                store,
                handle,
                Arc::new(EuclideanMatcher),
                Tolerance::new(tolerance).unwrap(),
                FaceSelection::First,
            ),
        }
    }

    async fn enroll(fx: &Fixture, account: &str, rgb: [u8; 3]) -> Identity {
        let identity = Identity::new(account, account);
        fx.enrollment
            .enroll(&RequestContext::new(), EnrollRequest::new(identity.clone()), image_of(&[rgb]))
            .await
            .unwrap();
        identity
    }

    #[tokio::test]
    async fn test_recognizes_each_enrolled_identity() {
        let fx = fixture(0.5);
        let alice = enroll(&fx, "alice", [255, 0, 0]).await;
        let bob = enroll(&fx, "bob", [0, 255, 0]).await;
        let carol = enroll(&fx, "carol", [0, 0, 255]).await;

        for who in [&alice, &bob, &carol] {
            let rgb: [u8; 3] = match who.account.as_str() {
                "alice" => [250, 5, 0],
                "bob" => [0, 250, 5],
                _ => [5, 0, 250],
            };
            let ctx = RequestContext::new().with_client("127.0.0.1");
            let auth = fx.recognition.recognize(&ctx, image_of(&[rgb])).await.unwrap();
            assert_eq!(auth.identity, *who);
            assert_eq!(auth.request_id, ctx.request_id);
        }
    }

    #[tokio::test]
    async fn test_no_face() {
        let fx = fixture(0.5);
        enroll(&fx, "alice", [255, 0, 0]).await;
        let err = fx.recognition.recognize(&RequestContext::new(), image_of(&[[0, 0, 0]])).await.unwrap_err();
        assert!(matches!(err, RecognizeError::NoFaceDetected));
        assert_eq!(err.rejection(), None);
    }

    #[tokio::test]
    async fn test_empty_gallery() {
        let fx = fixture(0.5);
        let err = fx.recognition.recognize(&RequestContext::new(), image_of(&[[255, 0, 0]])).await.unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::EmptyGallery));
        assert_eq!(err.to_string(), "face not recognized");
    }

    #[tokio::test]
    async fn test_stranger_is_rejected_uniformly() {
        let fx = fixture(0.5);
        enroll(&fx, "alice", [255, 0, 0]).await;
        let err = fx.recognition.recognize(&RequestContext::new(), image_of(&[[0, 255, 0]])).await.unwrap_err();
        assert!(matches!(err.rejection(), Some(Rejection::ToleranceExceeded { .. })));
        assert_eq!(err.to_string(), "face not recognized");
    }

    #[tokio::test]
    async fn test_first_enrolled_wins_tie() {
        let fx = fixture(0.9);
        let first = enroll(&fx, "first", [255, 0, 0]).await;
        enroll(&fx, "second", [0, 255, 0]).await;
        // (128, 128, 0) sits exactly halfway between the two enrolled colours.
        let auth = fx.recognition.recognize(&RequestContext::new(), image_of(&[[128, 128, 0]])).await.unwrap();
        assert_eq!(auth.identity.id, first.id);
    }

    #[tokio::test]
    async fn test_removed_identity_is_not_recognized() {
        let fx = fixture(0.5);
        let alice = enroll(&fx, "alice", [255, 0, 0]).await;
        fx.store.remove_identity(alice.id).await.unwrap();
        let err = fx.recognition.recognize(&RequestContext::new(), image_of(&[[255, 0, 0]])).await.unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::EmptyGallery));
    }

    #[tokio::test]
    async fn test_probe_dimension_mismatch() {
        let fx = fixture(0.5);
        crate::enrollment::enroll_embedding(
            fx.store.as_ref(),
            &RequestContext::new(),
            EnrollRequest::new(Identity::new("legacy", "Legacy")),
            crate::types::Embedding::new(vec![0.0; 128]),
        )
        .await
        .unwrap();
        let err = fx.recognition.recognize(&RequestContext::new(), image_of(&[[255, 0, 0]])).await.unwrap_err();
        assert!(matches!(err, RecognizeError::DimensionMismatch { expected: 128, actual: 3 }));
    }
}
