use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of an enrolled person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(Uuid);

impl IdentityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for IdentityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Access tier granted to an identity after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// General access.
    #[default]
    General = 1,
    /// Restricted to directors.
    Restricted = 2,
    /// Exclusive to the top tier.
    Exclusive = 3,
}

impl AccessLevel {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::General),
            2 => Some(Self::Restricted),
            3 => Some(Self::Exclusive),
            _ => None,
        }
    }
}

/// A person who can authenticate, by credentials or by face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    /// Credential-login account this identity resolves to.
    pub account: String,
    pub display_name: String,
    pub access_level: AccessLevel,
    pub organizational_unit: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(account: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: IdentityId::new(),
            account: account.into(),
            display_name: display_name.into(),
            access_level: AccessLevel::default(),
            organizational_unit: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_access_level(mut self, level: AccessLevel) -> Self {
        self.access_level = level;
        self
    }

    pub fn with_organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = Some(unit.into());
        self
    }
}

/// Bounding box of a detected face in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face feature vector (128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding, when the extractor reports one.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Non-empty with every component finite.
    pub fn is_well_formed(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must compare embeddings of equal dimension; extra trailing
    /// values of the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face reported by the feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

/// The enrolled biometric record of an identity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSignature {
    pub identity_id: IdentityId,
    pub embedding: Embedding,
    /// Where the source image was kept, if anywhere.
    pub source_image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FaceSignature {
    pub fn new(identity_id: IdentityId, embedding: Embedding, source_image: Option<String>) -> Self {
        Self {
            identity_id,
            embedding,
            source_image,
            created_at: Utc::now(),
        }
    }
}

/// One candidate in a matching gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity_id: IdentityId,
    pub embedding: Embedding,
}

/// Why a probe was not accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// Nobody is enrolled.
    EmptyGallery,
    /// The closest candidate was not strictly below the tolerance.
    ToleranceExceeded { best_distance: f32 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyGallery => f.write_str("empty gallery"),
            Self::ToleranceExceeded { best_distance } => {
                write!(f, "tolerance exceeded (best distance {best_distance:.4})")
            }
        }
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub accepted: bool,
    /// Euclidean distance of the best candidate; `None` when the gallery was empty.
    pub distance: Option<f32>,
    /// Identity of the accepted candidate (if any).
    pub identity_id: Option<IdentityId>,
}

impl MatchResult {
    pub fn rejection(&self) -> Option<Rejection> {
        if self.accepted {
            return None;
        }
        Some(match self.distance {
            None => Rejection::EmptyGallery,
            Some(best_distance) => Rejection::ToleranceExceeded { best_distance },
        })
    }
}

/// Explicit per-request context supplied by the surrounding web layer.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client: None,
        }
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A successful biometric login, equivalent to a passed credential check.
#[derive(Debug, Clone)]
pub struct AuthenticatedIdentity {
    pub identity: Identity,
    pub request_id: Uuid,
    pub authenticated_at: DateTime<Utc>,
}
