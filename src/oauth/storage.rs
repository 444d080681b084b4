//! Credential storage
//!
//! The credential store is shared by every client process on the machine. It is
//! both durable storage and the cross-process signaling channel: a write in one
//! process surfaces as a change notification in every other process watching
//! that key. Notifications carry no payload; subscribers re-read.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Change feed capacity; a lagging subscriber simply re-reads
const FEED_CAPACITY: usize = 64;

/// Persistent, eventually-consistent key-value store with change notification
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read a value. Unreadable or corrupt entries read as absent.
    async fn get(&self, key: &str) -> Option<String>;

    /// Write a value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribe to changes of one key. Dropping the subscription unsubscribes.
    fn watch(&self, key: &str) -> StoreSubscription;
}

/// Per-deployment store key namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    namespace: String,
}

impl StoreKeys {
    /// Keys for the deployment with this stable identifier
    #[must_use]
    pub fn new(stable_identifier: &str) -> Self {
        Self {
            namespace: stable_identifier.to_string(),
        }
    }

    /// Raw session credential (the current access token)
    #[must_use]
    pub fn session_token(&self) -> String {
        format!("{}.session", self.namespace)
    }

    /// Serialized token record
    #[must_use]
    pub fn token_metadata(&self) -> String {
        format!("{}.oauth.tokens", self.namespace)
    }

    /// Serialized client registration
    #[must_use]
    pub fn client_registration(&self) -> String {
        format!("{}.oauth.client", self.namespace)
    }
}

/// A subscription to one key's changes
pub struct StoreSubscription {
    tag: String,
    rx: broadcast::Receiver<String>,
}

impl StoreSubscription {
    /// Wait for the next change of the watched key
    ///
    /// Returns `false` once the store has shut down.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Ok(tag) if tag == self.tag => return true,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Credential change feed lagged");
                    return true;
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }
}

#[derive(Clone)]
struct ChangeFeed {
    tx: broadcast::Sender<String>,
}

impl ChangeFeed {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    fn publish(&self, tag: &str) {
        // No subscribers is fine
        let _ = self.tx.send(tag.to_string());
    }

    fn subscribe(&self, tag: String) -> StoreSubscription {
        StoreSubscription {
            tag,
            rx: self.tx.subscribe(),
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory credential store
///
/// Shared via `Arc` it behaves like one machine-wide store, which is how tests
/// model several client processes.
#[derive(Clone)]
pub struct InMemoryCredentialStore {
    values: Arc<RwLock<HashMap<String, String>>>,
    feed: ChangeFeed,
}

impl InMemoryCredentialStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            feed: ChangeFeed::new(),
        }
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .insert(key.to_string(), value.to_string());
        self.feed.publish(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = self.values.write().remove(key).is_some();
        if removed {
            self.feed.publish(key);
        }
        Ok(())
    }

    fn watch(&self, key: &str) -> StoreSubscription {
        self.feed.subscribe(key.to_string())
    }
}

// ============================================================================
// File store
// ============================================================================

/// File-backed credential store
///
/// One file per key inside a private directory. Writes go through a temporary
/// file and a rename so readers never observe a partial value. A directory
/// watcher turns writes by other processes into change notifications.
pub struct FileCredentialStore {
    base_dir: PathBuf,
    feed: ChangeFeed,
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileCredentialStore {
    /// Open (and create) a store rooted at `base_dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        if !base_dir.exists() {
            std::fs::create_dir_all(&base_dir).map_err(|e| {
                Error::Store(format!("Failed to create credential directory: {e}"))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&base_dir, std::fs::Permissions::from_mode(0o700));
            }
        }

        let feed = ChangeFeed::new();
        let watcher = match Self::create_watcher(&base_dir, feed.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(directory = %base_dir.display(), error = %e, "Credential watcher unavailable; changes from other processes will not be observed");
                None
            }
        };

        info!(directory = %base_dir.display(), "Opened credential store");
        Ok(Self {
            base_dir,
            feed,
            _watcher: Mutex::new(watcher),
        })
    }

    /// Open the store in the default location (`<config dir>/remote-oauth/credentials`)
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined or created.
    pub fn default_location() -> Result<Self> {
        Self::new(default_directory()?)
    }

    /// Store directory
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(file_name_for(key))
    }

    fn create_watcher(base_dir: &Path, feed: ChangeFeed) -> Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    for path in &event.paths {
                        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                            continue;
                        };
                        // Temporary files start with '.'
                        if name.starts_with('.') || !name.ends_with(FILE_SUFFIX) {
                            continue;
                        }
                        debug!(file = name, kind = ?event.kind, "Credential file changed");
                        feed.publish(name);
                    }
                }
                Err(e) => warn!(error = %e, "Credential watcher error"),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Store(format!("Failed to create credential watcher: {e}")))?;

        watcher
            .watch(base_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Store(format!("Failed to watch credential directory: {e}")))?;

        Ok(watcher)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, key: &str) -> Option<String> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, "Credential file is not valid UTF-8");
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read credential file");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let name = file_name_for(key);
        let path = self.base_dir.join(&name);
        let tmp = self
            .base_dir
            .join(format!(".{name}.{:016x}.tmp", rand::random::<u64>()));

        // Owner-only from creation
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let written = async {
            let mut file = options.open(&tmp).await?;
            file.write_all(value.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Store(format!("Failed to write credential file: {e}")));
        }

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Store(format!("Failed to replace credential file: {e}")));
        }

        self.feed.publish(&name);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let name = file_name_for(key);
        match tokio::fs::remove_file(self.base_dir.join(&name)).await {
            Ok(()) => {
                self.feed.publish(&name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(format!("Failed to delete credential file: {e}"))),
        }
    }

    fn watch(&self, key: &str) -> StoreSubscription {
        self.feed.subscribe(file_name_for(key))
    }
}

const FILE_SUFFIX: &str = ".cred";

fn file_name_for(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with('.') {
        name.insert(0, '_');
    }
    name.push_str(FILE_SUFFIX);
    name
}

/// Default credential directory
///
/// # Errors
///
/// Returns an error if the platform config directory cannot be determined.
pub fn default_directory() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| Error::Store("Cannot determine config directory".to_string()))?;
    Ok(base.join("remote-oauth").join("credentials"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = StoreKeys::new("dev.example.com");
        assert_eq!(keys.session_token(), "dev.example.com.session");
        assert_eq!(keys.token_metadata(), "dev.example.com.oauth.tokens");
        assert_eq!(keys.client_registration(), "dev.example.com.oauth.client");
        assert_ne!(
            StoreKeys::new("a.example.com").token_metadata(),
            keys.token_metadata()
        );
    }

    #[test]
    fn file_names_are_safe() {
        assert_eq!(file_name_for("a.b/c"), "a.b_c.cred");
        assert_eq!(file_name_for(".hidden"), "_.hidden.cred");
    }

    // =========================================================================
    // In-memory store
    // =========================================================================

    #[tokio::test]
    async fn memory_set_get_delete() {
        let store = InMemoryCredentialStore::new();
        assert!(store.get("k").await.is_none());
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.is_none());
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn memory_notifies_only_watched_key() {
        let store = InMemoryCredentialStore::new();
        let mut sub = store.watch("tokens");
        store.set("other", "x").await.unwrap();
        store.set("tokens", "y").await.unwrap();
        let changed = tokio::time::timeout(Duration::from_secs(1), sub.changed())
            .await
            .unwrap();
        assert!(changed);
    }

    #[tokio::test]
    async fn memory_clones_share_state() {
        let a = InMemoryCredentialStore::new();
        let b = a.clone();
        let mut sub = b.watch("k");
        a.set("k", "1").await.unwrap();
        assert!(sub.changed().await);
        assert_eq!(b.get("k").await.as_deref(), Some("1"));
    }

    // =========================================================================
    // File store
    // =========================================================================

    #[tokio::test]
    async fn file_round_trip_and_notify() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("creds")).unwrap();
        let mut sub = store.watch("dev.oauth.tokens");

        store.set("dev.oauth.tokens", "{\"a\":1}").await.unwrap();
        assert_eq!(store.get("dev.oauth.tokens").await.as_deref(), Some("{\"a\":1}"));
        assert!(
            tokio::time::timeout(Duration::from_secs(2), sub.changed())
                .await
                .unwrap()
        );

        store.delete("dev.oauth.tokens").await.unwrap();
        assert!(store.get("dev.oauth.tokens").await.is_none());
    }

    #[tokio::test]
    async fn file_write_from_another_instance_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let watching = FileCredentialStore::new(dir.path().to_path_buf()).unwrap();
        let writing = FileCredentialStore::new(dir.path().to_path_buf()).unwrap();
        let mut sub = watching.watch("dev.oauth.tokens");

        writing.set("dev.oauth.tokens", "{\"a\":2}").await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(10), sub.changed())
                .await
                .unwrap()
        );
        assert_eq!(watching.get("dev.oauth.tokens").await.as_deref(), Some("{\"a\":2}"));
    }

    #[tokio::test]
    async fn file_write_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().to_path_buf()).unwrap();
        store.set("k", "1").await.unwrap();
        store.set("k", "2").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![file_name_for("k")]);
    }

    #[tokio::test]
    async fn file_corruption_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().to_path_buf()).unwrap();
        std::fs::write(dir.path().join(file_name_for("k")), [0xff, 0xfe, 0x00]).unwrap();
        assert!(store.get("k").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().to_path_buf()).unwrap();
        store.set("k", "secret").await.unwrap();
        let mode = std::fs::metadata(dir.path().join(file_name_for("k")))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
