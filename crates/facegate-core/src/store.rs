//! Encoding store contract and an in-process implementation.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{FaceSignature, GalleryEntry, Identity, IdentityId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no face signature for identity {0}")]
    NotFound(IdentityId),
    #[error("identity {0} does not exist")]
    IdentityNotFound(IdentityId),
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("embedding for identity {0} is empty or has non-finite values")]
    InvalidEmbedding(IdentityId),
    #[error("embedding dimension mismatch: store holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt store record: {0}")]
    Corrupt(String),
}

/// Persistence boundary for identities and their face signatures.
///
/// Every mutation is atomic. Reads return consistent snapshots.
#[async_trait]
pub trait EncodingStore: Send + Sync {
    /// Insert a new identity together with its first signature.
    async fn create_identity(&self, identity: &Identity, signature: &FaceSignature) -> Result<(), StoreError>;

    /// Insert or replace the signature of an existing identity.
    async fn put(&self, signature: &FaceSignature) -> Result<(), StoreError>;

    async fn get(&self, identity_id: IdentityId) -> Result<FaceSignature, StoreError>;

    async fn identity(&self, identity_id: IdentityId) -> Result<Identity, StoreError>;

    async fn identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// All signatures in insertion order.
    async fn all_signatures(&self) -> Result<Vec<GalleryEntry>, StoreError>;

    /// Remove an identity and its signature. Returns false if it did not exist.
    async fn remove_identity(&self, identity_id: IdentityId) -> Result<bool, StoreError>;

    /// Established embedding dimension, if any signature is stored.
    async fn dimension(&self) -> Result<Option<usize>, StoreError>;
}

/// Reject vectors that could not be matched or persisted faithfully.
pub fn check_well_formed(signature: &FaceSignature) -> Result<(), StoreError> {
    if signature.embedding.is_well_formed() {
        Ok(())
    } else {
        Err(StoreError::InvalidEmbedding(signature.identity_id))
    }
}

#[derive(Default)]
struct MemoryState {
    identities: Vec<Identity>,
    /// Insertion order; replacement moves an entry to the end.
    signatures: Vec<FaceSignature>,
}

impl MemoryState {
    fn dimension(&self) -> Option<usize> {
        self.signatures.first().map(|s| s.embedding.dimension())
    }

    fn check_dimension(&self, signature: &FaceSignature) -> Result<(), StoreError> {
        check_well_formed(signature)?;
        let actual = signature.embedding.dimension();
        match self.dimension() {
            Some(expected) if expected != actual => Err(StoreError::DimensionMismatch { expected, actual }),
            _ => Ok(()),
        }
    }

    fn has_identity(&self, id: IdentityId) -> bool {
        self.identities.iter().any(|i| i.id == id)
    }
}

/// Process-local store. The mutex is held only for the duration of a
/// mutation or a snapshot copy.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl EncodingStore for MemoryStore {
    async fn create_identity(&self, identity: &Identity, signature: &FaceSignature) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state
            .identities
            .iter()
            .any(|i| i.id == identity.id || i.account == identity.account)
        {
            return Err(StoreError::DuplicateIdentity(identity.account.clone()));
        }
        state.check_dimension(signature)?;

        let mut signature = signature.clone();
        signature.identity_id = identity.id;
        state.identities.push(identity.clone());
        state.signatures.push(signature);
        Ok(())
    }

    async fn put(&self, signature: &FaceSignature) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if !state.has_identity(signature.identity_id) {
            return Err(StoreError::IdentityNotFound(signature.identity_id));
        }
        state.check_dimension(signature)?;

        state.signatures.retain(|s| s.identity_id != signature.identity_id);
        state.signatures.push(signature.clone());
        Ok(())
    }

    async fn get(&self, identity_id: IdentityId) -> Result<FaceSignature, StoreError> {
        let state = self.lock()?;
        state
            .signatures
            .iter()
            .find(|s| s.identity_id == identity_id)
            .cloned()
            .ok_or(StoreError::NotFound(identity_id))
    }

    async fn identity(&self, identity_id: IdentityId) -> Result<Identity, StoreError> {
        let state = self.lock()?;
        state
            .identities
            .iter()
            .find(|i| i.id == identity_id)
            .cloned()
            .ok_or(StoreError::IdentityNotFound(identity_id))
    }

    async fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.lock()?.identities.clone())
    }

    async fn all_signatures(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .signatures
            .iter()
            .map(|s| GalleryEntry {
                identity_id: s.identity_id,
                embedding: s.embedding.clone(),
            })
            .collect())
    }

    async fn remove_identity(&self, identity_id: IdentityId) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let before = state.identities.len();
        state.identities.retain(|i| i.id != identity_id);
        state.signatures.retain(|s| s.identity_id != identity_id);
        Ok(state.identities.len() != before)
    }

    async fn dimension(&self) -> Result<Option<usize>, StoreError> {
        Ok(self.lock()?.dimension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    fn enrolled(account: &str, values: Vec<f32>) -> (Identity, FaceSignature) {
        let identity = Identity::new(account, account.to_uppercase());
        let signature = FaceSignature::new(identity.id, Embedding::new(values), None);
        (identity, signature)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        let (alice, sig) = enrolled("alice", vec![0.1, 0.2, 0.3]);
        store.create_identity(&alice, &sig).await.unwrap();

        assert_eq!(store.get(alice.id).await.unwrap(), sig);
        assert_eq!(store.identity(alice.id).await.unwrap(), alice);
        assert_eq!(store.dimension().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryStore::new();
        let id = IdentityId::new();
        assert!(matches!(store.get(id).await, Err(StoreError::NotFound(x)) if x == id));
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let store = MemoryStore::new();
        let (a, sig_a) = enrolled("alice", vec![0.1, 0.2]);
        store.create_identity(&a, &sig_a).await.unwrap();
        let (b, sig_b) = enrolled("alice", vec![0.3, 0.4]);
        assert!(matches!(
            store.create_identity(&b, &sig_b).await,
            Err(StoreError::DuplicateIdentity(_))
        ));
        assert_eq!(store.identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_leaves_store_unchanged() {
        let store = MemoryStore::new();
        let (a, sig_a) = enrolled("alice", vec![0.1, 0.2, 0.3]);
        store.create_identity(&a, &sig_a).await.unwrap();

        let (b, sig_b) = enrolled("bob", vec![0.1, 0.2]);
        assert!(matches!(
            store.create_identity(&b, &sig_b).await,
            Err(StoreError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(store.identity(b.id).await.is_err());

        let bad = FaceSignature::new(a.id, Embedding::new(vec![1.0; 4]), None);
        assert!(matches!(store.put(&bad).await, Err(StoreError::DimensionMismatch { .. })));
        assert_eq!(store.get(a.id).await.unwrap(), sig_a);
        assert_eq!(store.all_signatures().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_replaces_and_moves_to_end() {
        let store = MemoryStore::new();
        let (a, sig_a) = enrolled("alice", vec![0.1, 0.1]);
        let (b, sig_b) = enrolled("bob", vec![0.9, 0.9]);
        store.create_identity(&a, &sig_a).await.unwrap();
        store.create_identity(&b, &sig_b).await.unwrap();

        let newer = FaceSignature::new(a.id, Embedding::new(vec![0.2, 0.2]), None);
        store.put(&newer).await.unwrap();

        let gallery = store.all_signatures().await.unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery[0].identity_id, b.id);
        assert_eq!(gallery[1].identity_id, a.id);
        assert_eq!(store.get(a.id).await.unwrap().embedding.values, vec![0.2, 0.2]);
    }

    #[tokio::test]
    async fn test_put_requires_identity() {
        let store = MemoryStore::new();
        let orphan = FaceSignature::new(IdentityId::new(), Embedding::new(vec![0.1]), None);
        assert!(matches!(store.put(&orphan).await, Err(StoreError::IdentityNotFound(_))));
        assert!(store.all_signatures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_or_empty_embeddings_rejected() {
        let store = MemoryStore::new();
        let (a, inf) = enrolled("alice", vec![f32::INFINITY, 0.0]);
        assert!(matches!(store.create_identity(&a, &inf).await, Err(StoreError::InvalidEmbedding(_))));
        assert!(store.identities().await.unwrap().is_empty());

        let (b, sig_b) = enrolled("bob", vec![0.1, 0.2]);
        store.create_identity(&b, &sig_b).await.unwrap();
        for values in [vec![f32::NAN, 0.0], Vec::new()] {
            let bad = FaceSignature::new(b.id, Embedding::new(values), None);
            assert!(matches!(store.put(&bad).await, Err(StoreError::InvalidEmbedding(_))));
        }
        assert_eq!(store.get(b.id).await.unwrap(), sig_b);
        assert_eq!(store.all_signatures().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_cascades() {
        let store = MemoryStore::new();
        let (a, sig_a) = enrolled("alice", vec![0.1]);
        store.create_identity(&a, &sig_a).await.unwrap();

        assert!(store.remove_identity(a.id).await.unwrap());
        assert!(!store.remove_identity(a.id).await.unwrap());
        assert!(matches!(store.get(a.id).await, Err(StoreError::NotFound(_))));
        assert_eq!(store.dimension().await.unwrap(), None);
    }
}
