use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use facegate_core::enrollment::{enroll_embedding, EnrollRequest};
use facegate_core::{
    AccessLevel, EncodingStore, Embedding, EuclideanMatcher, Identity, IdentityId, Matcher, RequestContext,
};
use facegate_store::{EmbeddingCipher, SqliteStore};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face enrollment and matching admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    General,
    Restricted,
    Exclusive,
}

impl From<Level> for AccessLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::General => AccessLevel::General,
            Level::Restricted => AccessLevel::Restricted,
            Level::Exclusive => AccessLevel::Exclusive,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities
    List,
    /// Show one identity and its signature metadata
    Show {
        /// Identity ID
        id: IdentityId,
    },
    /// Remove an identity and its face signature
    Remove {
        /// Identity ID
        id: IdentityId,
    },
    /// Enroll a precomputed face encoding (JSON array of numbers)
    Import {
        /// Credential-login account name
        #[arg(short, long)]
        account: String,
        /// Display name (new accounts only)
        #[arg(short, long)]
        name: String,
        /// Access level for a new account [default: general]
        #[arg(short, long, value_enum)]
        level: Option<Level>,
        /// Organizational unit (new accounts only)
        #[arg(short, long)]
        unit: Option<String>,
        /// Path to the encoding file
        #[arg(short, long)]
        encoding: PathBuf,
        /// Source image reference to record with the signature
        #[arg(long)]
        source_image: Option<String>,
        /// Replace the signature of an existing account
        #[arg(long)]
        replace: bool,
    },
    /// Match a probe encoding against the gallery
    Match {
        /// Path to the probe encoding file
        #[arg(short, long)]
        probe: PathBuf,
    },
    /// Show store and matcher status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let cipher = config
        .store_key
        .as_deref()
        .map(EmbeddingCipher::from_passphrase)
        .transpose()
        .context("invalid store key")?;
    let store = Arc::new(SqliteStore::open(&config.db_path, cipher).await?);

    match cli.command {
        Commands::List => {
            for identity in store.identities().await? {
                let enrolled = store.get(identity.id).await.is_ok();
                println!(
                    "{}",
                    serde_json::json!({
                        "id": identity.id,
                        "account": identity.account,
                        "name": identity.display_name,
                        "access_level": identity.access_level,
                        "unit": identity.organizational_unit,
                        "enrolled": enrolled,
                    })
                );
            }
        }
        Commands::Show { id } => {
            let identity = store.identity(id).await?;
            let signature = store.get(id).await.ok();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "identity": identity,
                    "signature": signature.map(|s| serde_json::json!({
                        "dimension": s.embedding.dimension(),
                        "model_version": s.embedding.model_version,
                        "source_image": s.source_image,
                        "created_at": s.created_at,
                    })),
                }))?
            );
        }
        Commands::Remove { id } => {
            if store.remove_identity(id).await? {
                println!("Removed identity {id}");
            } else {
                bail!("no identity with id {id}");
            }
        }
        Commands::Import {
            account,
            name,
            level,
            unit,
            encoding,
            source_image,
            replace,
        } => {
            let embedding = read_encoding(&encoding)?;
            let existing = store
                .identities()
                .await?
                .into_iter()
                .find(|i| i.account == account);
            let (identity, ignored) = import_identity(existing, account, name, level, unit);
            if !ignored.is_empty() {
                tracing::warn!(account = %identity.account, ignored = ?ignored, "existing account keeps its profile");
                eprintln!(
                    "warning: account '{}' already exists; ignoring {}",
                    identity.account,
                    ignored.join(", ")
                );
            }
            let mut request = EnrollRequest::new(identity);
            request.replace = replace;
            request.source_image = source_image;

            let ctx = RequestContext::new();
            let signature = enroll_embedding(store.as_ref(), &ctx, request, embedding).await?;
            println!(
                "Enrolled identity {} ({} values)",
                signature.identity_id,
                signature.embedding.dimension()
            );
        }
        Commands::Match { probe } => {
            let probe = read_encoding(&probe)?;
            let gallery = store.all_signatures().await?;
            if let Some(dim) = gallery.first().map(|g| g.embedding.dimension()) {
                if dim != probe.dimension() {
                    bail!("probe has {} values but the gallery holds {dim}", probe.dimension());
                }
            }
            let result = EuclideanMatcher.compare(&probe, &gallery, config.tolerance);
            let account = match result.identity_id {
                Some(id) => Some(store.identity(id).await?.account),
                None => None,
            };
            println!(
                "{}",
                serde_json::json!({
                    "accepted": result.accepted,
                    "distance": result.distance,
                    "identity": result.identity_id,
                    "account": account,
                    "reason": result.rejection().map(|r| r.to_string()),
                    "tolerance": config.tolerance,
                    "gallery_size": gallery.len(),
                })
            );
        }
        Commands::Status => {
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "db_path": config.db_path,
                    "identities": store.identities().await?.len(),
                    "dimension": store.dimension().await?,
                    "tolerance": config.tolerance,
                    "face_selection": config.face_selection,
                    "extract_timeout_secs": config.extract_timeout_secs,
                    "encrypted": config.store_key.is_some(),
                })
            );
        }
    }

    Ok(())
}

/// Identity an import enrolls into, plus the profile flags that had no effect.
///
/// An existing account keeps its stored profile; import only touches its
/// face signature.
fn import_identity(
    existing: Option<Identity>,
    account: String,
    name: String,
    level: Option<Level>,
    unit: Option<String>,
) -> (Identity, Vec<&'static str>) {
    match existing {
        Some(identity) => {
            let mut ignored = Vec::new();
            if name != identity.display_name {
                ignored.push("--name");
            }
            if level.is_some() {
                ignored.push("--level");
            }
            if unit.is_some() {
                ignored.push("--unit");
            }
            (identity, ignored)
        }
        None => {
            let mut identity =
                Identity::new(account, name).with_access_level(level.map(AccessLevel::from).unwrap_or_default());
            identity.organizational_unit = unit;
            (identity, Vec::new())
        }
    }
}

/// Read an encoding stored as a JSON array of numbers.
fn read_encoding(path: &Path) -> Result<Embedding> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let values: Vec<f32> =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON array of numbers", path.display()))?;
    if values.is_empty() {
        bail!("{} holds an empty encoding", path.display());
    }
    if values.iter().any(|v| !v.is_finite()) {
        bail!("{} holds values outside the f32 range", path.display());
    }
    Ok(Embedding::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_new_account_uses_flags() {
        let (identity, ignored) = import_identity(
            None,
            "alice".into(),
            "Alice".into(),
            Some(Level::Exclusive),
            Some("Board".into()),
        );
        assert!(ignored.is_empty());
        assert_eq!(identity.account, "alice");
        assert_eq!(identity.display_name, "Alice");
        assert_eq!(identity.access_level, AccessLevel::Exclusive);
        assert_eq!(identity.organizational_unit.as_deref(), Some("Board"));

        let (identity, _) = import_identity(None, "bob".into(), "Bob".into(), None, None);
        assert_eq!(identity.access_level, AccessLevel::General);
    }

    #[test]
    fn test_import_existing_account_reports_ignored_flags() {
        let stored = Identity::new("alice", "Alice").with_access_level(AccessLevel::Restricted);

        let (identity, ignored) = import_identity(
            Some(stored.clone()),
            "alice".into(),
            "Alice Cooper".into(),
            Some(Level::Exclusive),
            Some("Board".into()),
        );
        assert_eq!(identity, stored);
        assert_eq!(ignored, vec!["--name", "--level", "--unit"]);

        let (identity, ignored) = import_identity(Some(stored.clone()), "alice".into(), "Alice".into(), None, None);
        assert_eq!(identity, stored);
        assert!(ignored.is_empty());
    }

    #[test]
    fn test_read_encoding_rejects_overflowing_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.json");
        std::fs::write(&path, "[1e300, 0.0]").unwrap();
        assert!(read_encoding(&path).is_err());

        std::fs::write(&path, "[0.5, -0.25]").unwrap();
        assert_eq!(read_encoding(&path).unwrap().values, vec![0.5, -0.25]);
    }
}
