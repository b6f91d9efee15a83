//! Enrollment: image → face signature → store, one signature per identity.

use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;
use tracing::Instrument;

use crate::extractor::{ExtractorHandle, FaceSelection};
use crate::store::{EncodingStore, StoreError};
use crate::types::{Embedding, FaceSignature, Identity, IdentityId, RequestContext};

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected in the image; please provide another photo")]
    NoFaceDetected,
    #[error("identity {0} already has a face signature")]
    AlreadyEnrolled(IdentityId),
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("identity {0} was removed during enrollment")]
    IdentityRemoved(IdentityId),
    #[error("embedding dimension mismatch: store holds {expected}, extractor produced {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("face embedding has non-finite values")]
    InvalidEmbedding,
    #[error("face extraction failed")]
    ExtractionFailed,
    #[error("encoding store unavailable")]
    StoreUnavailable,
}

/// What to enroll.
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    /// New identity, or an existing one when re-enrolling.
    pub identity: Identity,
    /// Replace an existing signature instead of failing with `AlreadyEnrolled`.
    pub replace: bool,
    /// Where the caller kept the source image, if it did.
    pub source_image: Option<String>,
}

impl EnrollRequest {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            replace: false,
            source_image: None,
        }
    }

    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn with_source_image(mut self, path: impl Into<String>) -> Self {
        self.source_image = Some(path.into());
        self
    }
}

pub struct EnrollmentService {
    store: Arc<dyn EncodingStore>,
    extractor: ExtractorHandle,
    selection: FaceSelection,
}

impl EnrollmentService {
    pub fn new(store: Arc<dyn EncodingStore>, extractor: ExtractorHandle, selection: FaceSelection) -> Self {
        Self {
            store,
            extractor,
            selection,
        }
    }

    /// Extract a face from `image` and store it as the identity's signature.
    ///
    /// A new identity is created together with its signature, atomically.
    pub async fn enroll(
        &self,
        ctx: &RequestContext,
        request: EnrollRequest,
        image: RgbImage,
    ) -> Result<FaceSignature, EnrollError> {
        let span = tracing::info_span!(
            "enroll",
            request_id = %ctx.request_id,
            identity = %request.identity.id,
            account = %request.identity.account,
        );
        async move {
            let existing = precheck(self.store.as_ref(), &request).await?;

            let detections = self.extractor.extract(image).await.map_err(|err| {
                tracing::warn!(error = %err, "extractor failed during enrollment");
                EnrollError::ExtractionFailed
            })?;
            let face_count = detections.len();
            let face = self.selection.select(detections).ok_or_else(|| {
                tracing::info!("no face detected in enrollment image");
                EnrollError::NoFaceDetected
            })?;
            if face_count > 1 {
                tracing::info!(faces = face_count, policy = ?self.selection, "multiple faces in enrollment image");
            }

            commit(self.store.as_ref(), &request, face.embedding, existing).await
        }
        .instrument(span)
        .await
    }

    /// Store an already-extracted embedding, with the same rules as [`enroll`](Self::enroll).
    pub async fn enroll_embedding(
        &self,
        ctx: &RequestContext,
        request: EnrollRequest,
        embedding: Embedding,
    ) -> Result<FaceSignature, EnrollError> {
        enroll_embedding(self.store.as_ref(), ctx, request, embedding).await
    }
}

/// Store an already-extracted embedding without going through an extractor.
pub async fn enroll_embedding(
    store: &dyn EncodingStore,
    ctx: &RequestContext,
    request: EnrollRequest,
    embedding: Embedding,
) -> Result<FaceSignature, EnrollError> {
    let span = tracing::info_span!(
        "enroll_embedding",
        request_id = %ctx.request_id,
        identity = %request.identity.id,
    );
    async move {
        let existing = precheck(store, &request).await?;
        commit(store, &request, embedding, existing).await
    }
    .instrument(span)
    .await
}

/// Returns whether the identity already exists in the store.
async fn precheck(store: &dyn EncodingStore, request: &EnrollRequest) -> Result<bool, EnrollError> {
    let id = request.identity.id;
    match store.identity(id).await {
        Ok(_) => {}
        Err(StoreError::IdentityNotFound(_)) => return Ok(false),
        Err(err) => return Err(map_store_error(err)),
    }
    match store.get(id).await {
        Ok(_) if !request.replace => Err(EnrollError::AlreadyEnrolled(id)),
        Ok(_) | Err(StoreError::NotFound(_)) => Ok(true),
        Err(err) => Err(map_store_error(err)),
    }
}

async fn commit(
    store: &dyn EncodingStore,
    request: &EnrollRequest,
    embedding: Embedding,
    existing: bool,
) -> Result<FaceSignature, EnrollError> {
    if embedding.values.is_empty() {
        tracing::warn!("extractor returned an empty embedding");
        return Err(EnrollError::NoFaceDetected);
    }
    if !embedding.is_well_formed() {
        tracing::warn!(dimension = embedding.dimension(), "refusing embedding with non-finite values");
        return Err(EnrollError::InvalidEmbedding);
    }
    let signature = FaceSignature::new(request.identity.id, embedding, request.source_image.clone());
    let write = if existing {
        store.put(&signature).await
    } else {
        store.create_identity(&request.identity, &signature).await
    };
    write.map_err(map_store_error)?;

    tracing::info!(
        dimension = signature.embedding.dimension(),
        replaced = existing,
        "face signature enrolled"
    );
    Ok(signature)
}

fn map_store_error(err: StoreError) -> EnrollError {
    match err {
        StoreError::DimensionMismatch { expected, actual } => {
            tracing::error!(expected, actual, "embedding dimension drift: check extractor version and gallery");
            EnrollError::DimensionMismatch { expected, actual }
        }
        StoreError::DuplicateIdentity(who) => EnrollError::DuplicateIdentity(who),
        StoreError::InvalidEmbedding(_) => EnrollError::InvalidEmbedding,
        StoreError::IdentityNotFound(id) => EnrollError::IdentityRemoved(id),
        other => {
            tracing::warn!(error = %other, "encoding store failure during enrollment");
            EnrollError::StoreUnavailable
        }
    }
}
