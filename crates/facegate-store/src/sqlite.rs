use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use facegate_core::{
    check_well_formed, AccessLevel, EncodingStore, Embedding, FaceSignature, GalleryEntry, Identity, IdentityId, StoreError,
};
use rusqlite::{params, ErrorCode, OptionalExtension};
use tokio_rusqlite::Connection;

use crate::cipher::EmbeddingCipher;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS identities (
    id                  TEXT PRIMARY KEY,
    account             TEXT NOT NULL UNIQUE,
    display_name        TEXT NOT NULL,
    access_level        INTEGER NOT NULL CHECK (access_level BETWEEN 1 AND 3),
    organizational_unit TEXT,
    created_at          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS face_signatures (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id   TEXT NOT NULL UNIQUE REFERENCES identities(id) ON DELETE CASCADE,
    dimension     INTEGER NOT NULL,
    embedding     BLOB NOT NULL,
    nonce         BLOB,
    model_version TEXT,
    source_image  TEXT,
    created_at    TEXT NOT NULL
);
";

const IDENTITY_COLUMNS: &str = "id, account, display_name, access_level, organizational_unit, created_at";
const SIGNATURE_COLUMNS: &str = "identity_id, dimension, embedding, nonce, model_version, source_image, created_at";

type CallResult<T> = Result<Result<T, StoreError>, tokio_rusqlite::Error>;

/// SQLite-backed encoding store.
///
/// All statements run on the connection's worker thread, so mutations are
/// serialized; each mutation is a single transaction.
pub struct SqliteStore {
    conn: Connection,
    cipher: Option<EmbeddingCipher>,
}

/// Raw signature row, decoded outside the connection thread.
struct SignatureRow {
    identity_id: String,
    dimension: i64,
    embedding: Vec<u8>,
    nonce: Option<Vec<u8>>,
    model_version: Option<String>,
    source_image: Option<String>,
    created_at: String,
}

struct IdentityRow {
    id: String,
    account: String,
    display_name: String,
    access_level: i64,
    organizational_unit: Option<String>,
    created_at: String,
}

/// Encoded signature ready for insertion.
struct SignatureInsert {
    identity_id: String,
    dimension: i64,
    embedding: Vec<u8>,
    nonce: Option<Vec<u8>>,
    model_version: Option<String>,
    source_image: Option<String>,
    created_at: String,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>, cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).await.map_err(unavailable)?;
        let store = Self::init(conn, cipher).await?;
        tracing::info!(path = %path.display(), encrypted = store.cipher.is_some(), "encoding store opened");
        Ok(store)
    }

    pub async fn open_in_memory(cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(unavailable)?;
        Self::init(conn, cipher).await
    }

    async fn init(conn: Connection, cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(unavailable)?;
        Ok(Self { conn, cipher })
    }

    fn encode(&self, signature: &FaceSignature) -> Result<SignatureInsert, StoreError> {
        let json = serde_json::to_vec(&signature.embedding.values)
            .map_err(|e| StoreError::Corrupt(format!("encode embedding: {e}")))?;
        let (embedding, nonce) = match &self.cipher {
            Some(cipher) => {
                let (nonce, ct) = cipher.seal(&json).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                (ct, Some(nonce))
            }
            None => (json, None),
        };
        Ok(SignatureInsert {
            identity_id: signature.identity_id.to_string(),
            dimension: signature.embedding.dimension() as i64,
            embedding,
            nonce,
            model_version: signature.embedding.model_version.clone(),
            source_image: signature.source_image.clone(),
            created_at: format_time(&signature.created_at),
        })
    }

    fn decode(&self, row: SignatureRow) -> Result<FaceSignature, StoreError> {
        let identity_id = parse_id(&row.identity_id)?;
        let json = match (&row.nonce, &self.cipher) {
            (Some(nonce), Some(cipher)) => cipher
                .open(nonce, &row.embedding)
                .map_err(|e| StoreError::Corrupt(format!("signature of {identity_id}: {e}")))?,
            (Some(_), None) => {
                return Err(StoreError::Corrupt(format!(
                    "signature of {identity_id} is encrypted but no store key is configured"
                )))
            }
            (None, _) => row.embedding,
        };
        let values: Vec<f32> = serde_json::from_slice(&json)
            .map_err(|e| StoreError::Corrupt(format!("signature of {identity_id}: {e}")))?;
        if values.len() as i64 != row.dimension {
            return Err(StoreError::Corrupt(format!(
                "signature of {identity_id}: recorded dimension {} but {} values",
                row.dimension,
                values.len()
            )));
        }
        Ok(FaceSignature {
            identity_id,
            embedding: Embedding {
                values,
                model_version: row.model_version,
            },
            source_image: row.source_image,
            created_at: parse_time(&row.created_at)?,
        })
    }
}

#[async_trait]
impl EncodingStore for SqliteStore {
    async fn create_identity(&self, identity: &Identity, signature: &FaceSignature) -> Result<(), StoreError> {
        check_well_formed(signature)?;
        let mut insert = self.encode(signature)?;
        insert.identity_id = identity.id.to_string();
        let row = identity_row(identity);

        let result: CallResult<()> = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let taken: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM identities WHERE id = ?1 OR account = ?2",
                        params![row.id, row.account],
                        |r| r.get(0),
                    )
                    .optional()?;
                if taken.is_some() {
                    return Ok(Err(StoreError::DuplicateIdentity(row.account)));
                }
                if let Err(e) = check_dimension(&tx, insert.dimension)? {
                    return Ok(Err(e));
                }
                tx.execute(
                    &format!("INSERT INTO identities ({IDENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                    params![
                        row.id,
                        row.account,
                        row.display_name,
                        row.access_level,
                        row.organizational_unit,
                        row.created_at
                    ],
                )?;
                insert_signature(&tx, &insert)?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await;

        match result {
            Ok(inner) => inner,
            Err(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateIdentity(identity.account.clone()))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn put(&self, signature: &FaceSignature) -> Result<(), StoreError> {
        check_well_formed(signature)?;
        let insert = self.encode(signature)?;
        let identity_id = signature.identity_id;

        let result: CallResult<()> = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: Option<i64> = tx
                    .query_row("SELECT 1 FROM identities WHERE id = ?1", [&insert.identity_id], |r| r.get(0))
                    .optional()?;
                if exists.is_none() {
                    return Ok(Err(StoreError::IdentityNotFound(identity_id)));
                }
                if let Err(e) = check_dimension(&tx, insert.dimension)? {
                    return Ok(Err(e));
                }
                tx.execute("DELETE FROM face_signatures WHERE identity_id = ?1", [&insert.identity_id])?;
                insert_signature(&tx, &insert)?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await;
        result.map_err(unavailable)?
    }

    async fn get(&self, identity_id: IdentityId) -> Result<FaceSignature, StoreError> {
        let id = identity_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {SIGNATURE_COLUMNS} FROM face_signatures WHERE identity_id = ?1"),
                        [&id],
                        signature_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(unavailable)?;
        let row = row.ok_or(StoreError::NotFound(identity_id))?;
        self.decode(row)
    }

    async fn identity(&self, identity_id: IdentityId) -> Result<Identity, StoreError> {
        let id = identity_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
                        [&id],
                        read_identity_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(unavailable)?;
        decode_identity(row.ok_or(StoreError::IdentityNotFound(identity_id))?)
    }

    async fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY created_at, id"))?;
                let rows = stmt
                    .query_map([], read_identity_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(unavailable)?;
        rows.into_iter().map(decode_identity).collect()
    }

    async fn all_signatures(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("SELECT {SIGNATURE_COLUMNS} FROM face_signatures ORDER BY seq"))?;
                let rows = stmt.query_map([], signature_row)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(unavailable)?;

        rows.into_iter()
            .map(|row| {
                let sig = self.decode(row)?;
                Ok(GalleryEntry {
                    identity_id: sig.identity_id,
                    embedding: sig.embedding,
                })
            })
            .collect()
    }

    async fn remove_identity(&self, identity_id: IdentityId) -> Result<bool, StoreError> {
        let id = identity_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                // Explicit delete keeps the cascade even if foreign keys were disabled.
                tx.execute("DELETE FROM face_signatures WHERE identity_id = ?1", [&id])?;
                let n = tx.execute("DELETE FROM identities WHERE id = ?1", [&id])?;
                tx.commit()?;
                Ok(n > 0)
            })
            .await
            .map_err(unavailable)?;
        if removed {
            tracing::info!(identity = %identity_id, "identity and face signature removed");
        }
        Ok(removed)
    }

    async fn dimension(&self) -> Result<Option<usize>, StoreError> {
        let dim = self
            .conn
            .call(|conn| {
                let dim: Option<i64> = conn
                    .query_row("SELECT dimension FROM face_signatures ORDER BY seq LIMIT 1", [], |r| r.get(0))
                    .optional()?;
                Ok(dim)
            })
            .await
            .map_err(unavailable)?;
        Ok(dim.map(|d| d as usize))
    }
}

fn check_dimension(tx: &rusqlite::Transaction<'_>, actual: i64) -> rusqlite::Result<Result<(), StoreError>> {
    let expected: Option<i64> = tx
        .query_row("SELECT dimension FROM face_signatures ORDER BY seq LIMIT 1", [], |r| r.get(0))
        .optional()?;
    Ok(match expected {
        Some(expected) if expected != actual => Err(StoreError::DimensionMismatch {
            expected: expected as usize,
            actual: actual as usize,
        }),
        _ => Ok(()),
    })
}

fn insert_signature(tx: &rusqlite::Transaction<'_>, s: &SignatureInsert) -> rusqlite::Result<()> {
    tx.execute(
        &format!("INSERT INTO face_signatures ({SIGNATURE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            s.identity_id,
            s.dimension,
            s.embedding,
            s.nonce,
            s.model_version,
            s.source_image,
            s.created_at
        ],
    )?;
    Ok(())
}

fn signature_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SignatureRow> {
    Ok(SignatureRow {
        identity_id: r.get(0)?,
        dimension: r.get(1)?,
        embedding: r.get(2)?,
        nonce: r.get(3)?,
        model_version: r.get(4)?,
        source_image: r.get(5)?,
        created_at: r.get(6)?,
    })
}

fn read_identity_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: r.get(0)?,
        account: r.get(1)?,
        display_name: r.get(2)?,
        access_level: r.get(3)?,
        organizational_unit: r.get(4)?,
        created_at: r.get(5)?,
    })
}

fn identity_row(identity: &Identity) -> IdentityRow {
    IdentityRow {
        id: identity.id.to_string(),
        account: identity.account.clone(),
        display_name: identity.display_name.clone(),
        access_level: identity.access_level.as_i64(),
        organizational_unit: identity.organizational_unit.clone(),
        created_at: format_time(&identity.created_at),
    }
}

fn decode_identity(row: IdentityRow) -> Result<Identity, StoreError> {
    let access_level = AccessLevel::from_i64(row.access_level)
        .ok_or_else(|| StoreError::Corrupt(format!("identity {}: access level {}", row.id, row.access_level)))?;
    Ok(Identity {
        id: parse_id(&row.id)?,
        account: row.account,
        display_name: row.display_name,
        access_level,
        organizational_unit: row.organizational_unit,
        created_at: parse_time(&row.created_at)?,
    })
}

fn parse_id(raw: &str) -> Result<IdentityId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("identity id '{raw}': {e}")))
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

fn unavailable(err: tokio_rusqlite::Error) -> StoreError {
    tracing::warn!(error = %err, "sqlite error");
    StoreError::Unavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrolled(account: &str, values: Vec<f32>) -> (Identity, FaceSignature) {
        let identity = Identity::new(account, format!("{account} display"))
            .with_access_level(AccessLevel::Restricted)
            .with_organizational_unit("Operations");
        let signature = FaceSignature::new(identity.id, Embedding::new(values), Some(format!("faces/{account}.jpg")));
        (identity, signature)
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let store = SqliteStore::open_in_memory(None).await.unwrap();
        let (alice, sig) = enrolled("alice", vec![0.25, -0.5, 0.125]);
        store.create_identity(&alice, &sig).await.unwrap();

        let loaded = store.identity(alice.id).await.unwrap();
        assert_eq!(loaded.account, "alice");
        assert_eq!(loaded.access_level, AccessLevel::Restricted);
        assert_eq!(loaded.organizational_unit.as_deref(), Some("Operations"));

        let got = store.get(alice.id).await.unwrap();
        assert_eq!(got.embedding.values, vec![0.25, -0.5, 0.125]);
        assert_eq!(got.source_image.as_deref(), Some("faces/alice.jpg"));
        assert_eq!(store.dimension().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let store = SqliteStore::open_in_memory(None).await.unwrap();
        let id = IdentityId::new();
        assert!(matches!(store.get(id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.identity(id).await, Err(StoreError::IdentityNotFound(_))));
        assert_eq!(store.dimension().await.unwrap(), None);
        assert!(store.all_signatures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_account() {
        let store = SqliteStore::open_in_memory(None).await.unwrap();
        let (a, sig_a) = enrolled("alice", vec![0.1, 0.2]);
        store.create_identity(&a, &sig_a).await.unwrap();
        let (b, sig_b) = enrolled("alice", vec![0.3, 0.4]);
        assert!(matches!(store.create_identity(&b, &sig_b).await, Err(StoreError::DuplicateIdentity(_))));
        assert_eq!(store.identities().await.unwrap().len(), 1);
        assert_eq!(store.all_signatures().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rolls_back_identity() {
        let store = SqliteStore::open_in_memory(None).await.unwrap();
        let (a, sig_a) = enrolled("alice", vec![0.1; 128]);
        store.create_identity(&a, &sig_a).await.unwrap();

        let (b, sig_b) = enrolled("bob", vec![0.1; 64]);
        assert!(matches!(
            store.create_identity(&b, &sig_b).await,
            Err(StoreError::DimensionMismatch { expected: 128, actual: 64 })
        ));
        assert!(matches!(store.identity(b.id).await, Err(StoreError::IdentityNotFound(_))));

        let bad = FaceSignature::new(a.id, Embedding::new(vec![0.0; 64]), None);
        assert!(matches!(store.put(&bad).await, Err(StoreError::DimensionMismatch { .. })));
        assert_eq!(store.get(a.id).await.unwrap().embedding.values, vec![0.1; 128]);
    }

    #[tokio::test]
    async fn test_put_replaces_and_reorders() {
        let store = SqliteStore::open_in_memory(None).await.unwrap();
        let (a, sig_a) = enrolled("alice", vec![0.1, 0.1]);
        let (b, sig_b) = enrolled("bob", vec![0.9, 0.9]);
        store.create_identity(&a, &sig_a).await.unwrap();
        store.create_identity(&b, &sig_b).await.unwrap();

        let gallery = store.all_signatures().await.unwrap();
        assert_eq!(gallery.iter().map(|g| g.identity_id).collect::<Vec<_>>(), vec![a.id, b.id]);

        store
            .put(&FaceSignature::new(a.id, Embedding::new(vec![0.2, 0.3]), None))
            .await
            .unwrap();
        let gallery = store.all_signatures().await.unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery[0].identity_id, b.id);
        assert_eq!(gallery[1].identity_id, a.id);
        assert_eq!(gallery[1].embedding.values, vec![0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_put_unknown_identity() {
        let store = SqliteStore::open_in_memory(None).await.unwrap();
        let orphan = FaceSignature::new(IdentityId::new(), Embedding::new(vec![0.1]), None);
        assert!(matches!(store.put(&orphan).await, Err(StoreError::IdentityNotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_cascades() {
        let store = SqliteStore::open_in_memory(None).await.unwrap();
        let (a, sig_a) = enrolled("alice", vec![0.1]);
        store.create_identity(&a, &sig_a).await.unwrap();

        assert!(store.remove_identity(a.id).await.unwrap());
        assert!(!store.remove_identity(a.id).await.unwrap());
        assert!(matches!(store.get(a.id).await, Err(StoreError::NotFound(_))));
        assert!(store.identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_encrypted_round_trip_and_wrong_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data").join("faces.db");

        let store = SqliteStore::open(&path, Some(EmbeddingCipher::from_passphrase("s3cret").unwrap()))
            .await
            .unwrap();
        let (a, sig_a) = enrolled("alice", vec![0.5, 0.25]);
        store.create_identity(&a, &sig_a).await.unwrap();
        assert_eq!(store.get(a.id).await.unwrap().embedding.values, vec![0.5, 0.25]);
        drop(store);

        let wrong = SqliteStore::open(&path, Some(EmbeddingCipher::from_passphrase("guess").unwrap()))
            .await
            .unwrap();
        assert!(matches!(wrong.all_signatures().await, Err(StoreError::Corrupt(_))));
        drop(wrong);

        let keyless = SqliteStore::open(&path, None).await.unwrap();
        assert!(matches!(keyless.get(a.id).await, Err(StoreError::Corrupt(_))));
        drop(keyless);
    }

    #[tokio::test]
    async fn test_concurrent_replacements_leave_one_signature() {
        let store = std::sync::Arc::new(SqliteStore::open_in_memory(None).await.unwrap());
        let (a, sig_a) = enrolled("alice", vec![0.0, 0.0]);
        store.create_identity(&a, &sig_a).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = a.id;
            tasks.push(tokio::spawn(async move {
                let sig = FaceSignature::new(id, Embedding::new(vec![i as f32, i as f32]), None);
                store.put(&sig).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let gallery = store.all_signatures().await.unwrap();
        assert_eq!(gallery.len(), 1);
        let v = &gallery[0].embedding.values;
        assert_eq!(v[0], v[1]);
    }

    #[tokio::test]
    async fn test_non_finite_or_empty_embeddings_rejected() {
        let store = SqliteStore::open_in_memory(None).await.unwrap();
        let (a, sig_a) = enrolled("alice", vec![f32::INFINITY, 0.0]);
        assert!(matches!(store.create_identity(&a, &sig_a).await, Err(StoreError::InvalidEmbedding(_))));
        assert!(store.identities().await.unwrap().is_empty());

        let (b, sig_b) = enrolled("bob", vec![0.5, 0.5]);
        store.create_identity(&b, &sig_b).await.unwrap();
        for values in [vec![f32::NAN, 0.0], Vec::new()] {
            let bad = FaceSignature::new(b.id, Embedding::new(values), None);
            assert!(matches!(store.put(&bad).await, Err(StoreError::InvalidEmbedding(_))));
        }

        let gallery = store.all_signatures().await.unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].embedding.values, vec![0.5, 0.5]);
    }
}
