//! On-disk storage for generated subscription files.
//!
//! Each subscription is one YAML file in a flat directory. Files produced
//! by the generator are named `clash_config_<owner>_<unix-secs>.yaml`, which
//! is what [`SubscriptionStore::reset`] keys on. Writes go through a temp
//! file and a rename so readers never see a half-written config.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;

/// Prefix shared by generated subscription files.
pub const GENERATED_PREFIX: &str = "clash_config_";

const MAX_FILENAME_LEN: usize = 128;

/// Suffixes tried by [`SubscriptionStore::save_new`] before giving up.
const MAX_NAME_ATTEMPTS: usize = 100;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid subscription file name '{0}'")]
    InvalidName(String),

    #[error("invalid owner name '{0}'")]
    InvalidOwner(String),

    #[error("config content is empty")]
    EmptyContent,

    #[error("config must contain a 'proxies' section")]
    MissingProxies,

    #[error("subscription '{0}' not found")]
    NotFound(String),

    #[error("no free file name left for '{0}'")]
    NameTaken(String),

    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Who a subscription belongs to. Restricted to characters that are safe
/// inside a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(String);

impl Owner {
    pub fn new(name: &str) -> Result<Self, StoreError> {
        let name = name.trim();
        let valid = !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(StoreError::InvalidOwner(name.to_string()))
        }
    }

    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flat directory of subscription YAML files.
#[derive(Debug, Clone)]
pub struct SubscriptionStore {
    dir: PathBuf,
}

impl SubscriptionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Config name used when the caller does not supply one.
    pub fn generated_name(owner: &Owner) -> String {
        format!(
            "{GENERATED_PREFIX}{}_{}",
            owner,
            chrono::Utc::now().timestamp()
        )
    }

    /// Write `content` under `filename` and return the final file name.
    ///
    /// `.yaml` is appended unless the name already ends in `.yaml`/`.yml`.
    pub async fn save(&self, filename: &str, content: &str) -> Result<String, StoreError> {
        let filename = normalize_filename(filename)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io("create", &self.dir, e))?;

        let path = self.dir.join(&filename);
        // Hidden and unique per write, so concurrent saves never share it
        // and `load`/`reset` never see it.
        let tmp_path = self.dir.join(format!(
            ".{filename}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp_path, content.as_bytes())
            .await
            .map_err(|e| StoreError::io("write", &tmp_path, e))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StoreError::io("rename", &tmp_path, e));
        }

        tracing::info!("saved subscription {}", path.display());
        Ok(filename)
    }

    /// Write `content` under a name nobody else holds yet.
    ///
    /// Tries `filename`, then `<stem>_1.<ext>`, `<stem>_2.<ext>` and so on,
    /// creating each candidate exclusively. Returns the name actually used.
    pub async fn save_new(&self, filename: &str, content: &str) -> Result<String, StoreError> {
        let base = normalize_filename(filename)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io("create", &self.dir, e))?;

        let (stem, ext) = base.rsplit_once('.').unwrap_or((base.as_str(), "yaml"));
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{stem}_{attempt}.{ext}")
            };
            let path = self.dir.join(&candidate);
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StoreError::io("create", &path, e)),
            };

            let written = async {
                file.write_all(content.as_bytes()).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = written {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(StoreError::io("write", &path, e));
            }

            tracing::info!("saved subscription {}", path.display());
            return Ok(candidate);
        }

        Err(StoreError::NameTaken(base))
    }

    /// Save a hand-edited config.
    ///
    /// The content must be non-empty and contain a `proxies:` section. When
    /// `filename` is blank a generated name for `owner` is used.
    pub async fn save_custom(
        &self,
        filename: Option<&str>,
        content: &str,
        owner: &Owner,
    ) -> Result<String, StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::EmptyContent);
        }
        if !content.contains("proxies:") {
            return Err(StoreError::MissingProxies);
        }
        match filename.map(str::trim).filter(|f| !f.is_empty()) {
            Some(name) => self.save(name, content).await,
            None => self.save_new(&Self::generated_name(owner), content).await,
        }
    }

    /// Read a stored subscription.
    pub async fn load(&self, filename: &str) -> Result<String, StoreError> {
        let filename = normalize_filename(filename)?;
        let path = self.dir.join(&filename);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(filename)),
            Err(e) => Err(StoreError::io("read", &path, e)),
        }
    }

    /// Delete every generated subscription belonging to `owner`.
    ///
    /// Returns the number of files removed. A missing directory counts as
    /// nothing to delete. Files that fail to delete are logged and skipped.
    pub async fn reset(&self, owner: &Owner) -> Result<usize, StoreError> {
        let prefix = format!("{GENERATED_PREFIX}{owner}_");
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io("read", &self.dir, e)),
        };

        let mut deleted = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("read", &self.dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".yaml") {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!("failed to delete subscription {name}: {e}"),
            }
        }

        tracing::info!("deleted {deleted} subscription(s) for {owner}");
        Ok(deleted)
    }
}

/// Validate a caller-supplied file name and add the `.yaml` extension.
fn normalize_filename(raw: &str) -> Result<String, StoreError> {
    let name = raw.trim();
    let invalid = name.is_empty()
        || name.len() > MAX_FILENAME_LEN
        || name.starts_with('.')
        || name.contains("..")
        || name.chars().any(|c| matches!(c, '/' | '\\' | ':') || c.is_control());
    if invalid {
        return Err(StoreError::InvalidName(raw.to_string()));
    }

    if name.ends_with(".yaml") || name.ends_with(".yml") {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "mixed-port: 7890\nproxies:\n  - name: \"a\"\n";

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path().join("subs"));

        let name = store.save("my-config", CONFIG).await.unwrap();
        assert_eq!(name, "my-config.yaml");
        assert_eq!(store.load("my-config.yaml").await.unwrap(), CONFIG);
        let leftovers = std::fs::read_dir(dir.path().join("subs")).unwrap().count();
        assert_eq!(leftovers, 1, "temp files must not survive a save");
    }

    #[tokio::test]
    async fn save_keeps_yml_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        assert_eq!(store.save("a.yml", CONFIG).await.unwrap(), "a.yml");
        assert_eq!(store.save("b.yaml", CONFIG).await.unwrap(), "b.yaml");
    }

    #[tokio::test]
    async fn save_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        for bad in ["../evil", "a/b", "a\\b", ".hidden", "", "  "] {
            let err = store.save(bad, CONFIG).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidName(_)), "{bad:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_saves_of_one_name_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let name = if i % 2 == 0 { "shared" } else { "shared.yml" };
                    store.save(name, &format!("proxies: [] # {i}\n")).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["shared.yaml", "shared.yml"]);
    }

    #[tokio::test]
    async fn save_new_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());

        let first = store.save_new("clash_config_alice_1", "first").await.unwrap();
        let second = store.save_new("clash_config_alice_1", "second").await.unwrap();
        let third = store.save_new("clash_config_alice_1.yaml", "third").await.unwrap();

        assert_eq!(first, "clash_config_alice_1.yaml");
        assert_eq!(second, "clash_config_alice_1_1.yaml");
        assert_eq!(third, "clash_config_alice_1_2.yaml");
        assert_eq!(store.load(&first).await.unwrap(), "first");
        assert_eq!(store.load(&second).await.unwrap(), "second");

        assert_eq!(store.reset(&Owner::new("alice").unwrap()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn save_custom_without_name_keeps_earlier_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        let owner = Owner::new("gina").unwrap();

        let a = store.save_custom(None, CONFIG, &owner).await.unwrap();
        let b = store.save_custom(Some(" "), CONFIG, &owner).await.unwrap();
        assert_ne!(a, b);
        assert!(store.load(&a).await.is_ok());
        assert!(store.load(&b).await.is_ok());
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        let err = store.load("nope.yaml").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn save_custom_validates_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        let owner = Owner::new("alice").unwrap();

        let err = store.save_custom(None, "   ", &owner).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyContent));
        let err = store.save_custom(None, "rules: []", &owner).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingProxies));

        let name = store.save_custom(None, CONFIG, &owner).await.unwrap();
        assert!(name.starts_with("clash_config_alice_"));
        assert!(name.ends_with(".yaml"));

        let name = store.save_custom(Some("edited"), CONFIG, &owner).await.unwrap();
        assert_eq!(name, "edited.yaml");
    }

    #[tokio::test]
    async fn reset_only_removes_owner_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        store.save("clash_config_alice_1", CONFIG).await.unwrap();
        store.save("clash_config_alice_2", CONFIG).await.unwrap();
        store.save("clash_config_bob_1", CONFIG).await.unwrap();
        store.save("alice-custom", CONFIG).await.unwrap();

        let deleted = store.reset(&Owner::new("alice").unwrap()).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.load("clash_config_bob_1.yaml").await.is_ok());
        assert!(store.load("alice-custom.yaml").await.is_ok());
        assert!(store.load("clash_config_alice_1.yaml").await.is_err());
    }

    #[tokio::test]
    async fn reset_missing_dir_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path().join("missing"));
        assert_eq!(store.reset(&Owner::anonymous()).await.unwrap(), 0);
    }

    #[test]
    fn owner_rejects_unsafe_names() {
        assert!(Owner::new("alice-01.x").is_ok());
        assert!(Owner::new("a/b").is_err());
        assert!(Owner::new("a_b").is_err());
        assert!(Owner::new("").is_err());
        assert_eq!(Owner::new(" bob ").unwrap().as_str(), "bob");
    }

    #[test]
    fn generated_name_has_owner_and_timestamp() {
        let name = SubscriptionStore::generated_name(&Owner::new("carol").unwrap());
        let suffix = name.strip_prefix("clash_config_carol_").unwrap();
        assert!(suffix.parse::<i64>().is_ok());
    }
}
