//! facegate-core — Face signature enrollment and gallery matching.
//!
//! Turns captured images into feature vectors through an external
//! [`FeatureExtractor`], persists one signature per identity behind the
//! [`EncodingStore`] contract, and authenticates logins by nearest-neighbour
//! search within a configured [`Tolerance`].

pub mod enrollment;
pub mod extractor;
pub mod matcher;
pub mod recognition;
pub mod store;
pub mod types;

pub use enrollment::{EnrollError, EnrollRequest, EnrollmentService};
pub use extractor::{spawn_extractor, ExtractorError, ExtractorHandle, FaceSelection, FeatureExtractor};
pub use matcher::{EuclideanMatcher, Matcher, Tolerance, DEFAULT_TOLERANCE};
pub use recognition::{RecognitionService, RecognizeError};
pub use store::{check_well_formed, EncodingStore, MemoryStore, StoreError};
pub use types::{
    AccessLevel, AuthenticatedIdentity, BoundingBox, Embedding, FaceDetection, FaceSignature, GalleryEntry,
    Identity, IdentityId, MatchResult, Rejection, RequestContext,
};
