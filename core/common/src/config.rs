//! Configuration gateway.
//!
//! The core only needs synchronous "read current value" accessors. Values
//! may change between two reads (the file is edited by the CLI while the
//! scheduler runs), so every accessor goes back to the source instead of
//! caching.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::warn;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Default remote API base URL.
pub const DEFAULT_API_URL: &str = "https://apitechsolutions.duckdns.org/api";
/// Default host checked by `ping`.
pub const DEFAULT_PING: &str = "apitechsolutions.duckdns.org";
/// Default sync interval in minutes.
pub const DEFAULT_INTERVAL_MINUTES: i64 = 5;
/// Configuration file name in the data directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Login credentials for the remote service.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Read-side view of the configuration.
pub trait ConfigSource: Send + Sync {
    /// Time to wait between two periodic sync cycles.
    fn sync_interval(&self) -> Result<Duration>;

    /// Base URL of the remote API, without trailing slash.
    fn api_url(&self) -> Result<String>;

    /// Credentials used to obtain a bearer token.
    fn credentials(&self) -> Result<Credentials>;

    /// URL hit by the reachability check.
    fn ping_url(&self) -> Result<String>;
}

/// Call `read` on the blocking pool.
///
/// [`FileConfig`] touches the filesystem on every access, so async code
/// goes through here instead of calling the accessors inline.
pub async fn read_config<T, F>(config: &Arc<dyn ConfigSource>, read: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ConfigSource) -> Result<T> + Send + 'static,
{
    let config = config.clone();
    tokio::task::spawn_blocking(move || read(config.as_ref()))
        .await
        .map_err(|e| Error::Process(format!("config read crashed: {}", e)))?
}

/// On-disk configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_ping")]
    pub ping: String,
    #[serde(default = "default_interval")]
    pub download_interval_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_ping() -> String {
    DEFAULT_PING.to_string()
}

fn default_interval() -> i64 {
    DEFAULT_INTERVAL_MINUTES
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ping: default_ping(),
            download_interval_minutes: default_interval(),
            username: None,
            password: None,
        }
    }
}

impl ConfigData {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn interval(&self) -> Result<Duration> {
        interval_from_minutes(self.download_interval_minutes)
    }

    fn api_url(&self) -> Result<String> {
        let url = self.api_url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(Error::Config("API URL is not configured".to_string()));
        }
        Ok(url.to_string())
    }

    fn credentials(&self) -> Result<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Ok(Credentials::new(user.clone(), pass.clone()))
            }
            _ => Err(Error::Config(
                "username or password is not configured".to_string(),
            )),
        }
    }

    fn ping_url(&self) -> Result<String> {
        let host = self.ping.trim();
        if host.is_empty() {
            return Err(Error::Config("ping host is not configured".to_string()));
        }
        if host.starts_with("http://") || host.starts_with("https://") {
            Ok(host.to_string())
        } else {
            Ok(format!("https://{}", host))
        }
    }
}

fn interval_from_minutes(minutes: i64) -> Result<Duration> {
    if minutes <= 0 {
        return Err(Error::Config(format!(
            "sync interval must be a positive number of minutes, got {}",
            minutes
        )));
    }
    u64::try_from(minutes)
        .ok()
        .and_then(|m| m.checked_mul(60))
        .map(Duration::from_secs)
        .ok_or_else(|| Error::Config(format!("sync interval of {} minutes is too large", minutes)))
}

/// Distinguishes temp files of concurrent saves within one process.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// JSON-file backed configuration, re-read on every access.
pub struct FileConfig {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    guard: Mutex<()>,
}

impl FileConfig {
    /// Open (and create with defaults if missing) the config file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self {
            path: path.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        };
        config.load()?;
        Ok(config)
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current document.
    ///
    /// A missing file is created with defaults; a corrupt file is replaced
    /// by the defaults.
    pub fn load(&self) -> Result<ConfigData> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        self.load_locked()
    }

    fn load_locked(&self) -> Result<ConfigData> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let data = ConfigData::default();
                self.save_locked(&data)?;
                return Ok(data);
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        match ConfigData::from_json(&content) {
            Ok(data) => Ok(data),
            Err(e) => {
                warn!(path = %self.path.display(), "corrupt config ({}), restoring defaults", e);
                let data = ConfigData::default();
                self.save_locked(&data)?;
                Ok(data)
            }
        }
    }

    fn save_locked(&self, data: &ConfigData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Config(format!("cannot create config dir: {}", e)))?;
            }
        }
        // Readers in other processes must never see a half-written file.
        let tmp = self.temp_path();
        std::fs::write(&tmp, data.to_json()?)
            .map_err(|e| Error::Config(format!("cannot write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::Config(format!("cannot write {}: {}", self.path.display(), e))
        })
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| CONFIG_FILENAME.to_string());
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
    }

    fn update(&self, f: impl FnOnce(&mut ConfigData)) -> Result<ConfigData> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = self.load_locked()?;
        f(&mut data);
        self.save_locked(&data)?;
        Ok(data)
    }

    pub fn set_api_url(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::Config("API URL cannot be empty".to_string()));
        }
        self.update(|data| data.api_url = url.to_string()).map(|_| ())
    }

    pub fn set_ping(&self, host: &str) -> Result<()> {
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::Config("ping host cannot be empty".to_string()));
        }
        self.update(|data| data.ping = host.to_string()).map(|_| ())
    }

    /// Change the sync interval. Takes effect from the next scheduled sleep.
    pub fn set_interval_minutes(&self, minutes: i64) -> Result<()> {
        interval_from_minutes(minutes)?;
        self.update(|data| data.download_interval_minutes = minutes)
            .map(|_| ())
    }

    pub fn set_credentials(&self, username: &str, password: &str) -> Result<()> {
        self.update(|data| {
            data.username = Some(username.to_string());
            data.password = Some(password.to_string());
        })
        .map(|_| ())
    }
}

impl ConfigSource for FileConfig {
    fn sync_interval(&self) -> Result<Duration> {
        self.load()?.interval()
    }

    fn api_url(&self) -> Result<String> {
        self.load()?.api_url()
    }

    fn credentials(&self) -> Result<Credentials> {
        self.load()?.credentials()
    }

    fn ping_url(&self) -> Result<String> {
        self.load()?.ping_url()
    }
}

/// In-memory configuration.
///
/// Useful for testing and embedding. Values can be changed at any time and
/// are observed by the next read.
pub struct MemoryConfig {
    data: RwLock<ConfigData>,
    interval_override: RwLock<Option<Duration>>,
}

impl MemoryConfig {
    pub fn new(data: ConfigData) -> Self {
        Self {
            data: RwLock::new(data),
            interval_override: RwLock::new(None),
        }
    }

    /// Configuration pointing at `api_url` with the given credentials.
    pub fn with_api(api_url: impl Into<String>, username: &str, password: &str) -> Self {
        Self::new(ConfigData {
            api_url: api_url.into(),
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..ConfigData::default()
        })
    }

    /// Replace the interval with an exact duration (sub-minute values allowed).
    pub fn set_interval(&self, interval: Duration) {
        *self
            .interval_override
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(interval);
    }

    /// Mutate the underlying document.
    pub fn update(&self, f: impl FnOnce(&mut ConfigData)) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        f(&mut data);
    }

    fn snapshot(&self) -> ConfigData {
        self.data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new(ConfigData::default())
    }
}

impl ConfigSource for MemoryConfig {
    fn sync_interval(&self) -> Result<Duration> {
        let interval = *self
            .interval_override
            .read()
            .unwrap_or_else(|e| e.into_inner());
        match interval {
            Some(d) if d.is_zero() => Err(Error::Config("sync interval is zero".to_string())),
            Some(d) => Ok(d),
            None => self.snapshot().interval(),
        }
    }

    fn api_url(&self) -> Result<String> {
        self.snapshot().api_url()
    }

    fn credentials(&self) -> Result<Credentials> {
        self.snapshot().credentials()
    }

    fn ping_url(&self) -> Result<String> {
        self.snapshot().ping_url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_created_with_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);

        let config = FileConfig::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.sync_interval().unwrap(), Duration::from_secs(5 * 60));
        assert_eq!(config.api_url().unwrap(), DEFAULT_API_URL);
        assert!(config.credentials().is_err());
    }

    #[test]
    fn test_corrupt_file_restored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "{ not json").unwrap();

        let config = FileConfig::open(&path).unwrap();
        assert_eq!(config.load().unwrap(), ConfigData::default());

        let restored = std::fs::read_to_string(&path).unwrap();
        assert!(ConfigData::from_json(&restored).is_ok());
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        std::fs::write(&path, r#"{"api_url": "http://localhost:8080/api/"}"#).unwrap();

        let config = FileConfig::open(&path).unwrap();
        assert_eq!(config.api_url().unwrap(), "http://localhost:8080/api");
        assert_eq!(config.sync_interval().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_hot_reload_between_reads() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        let config = FileConfig::open(&path).unwrap();

        // Another process edits the file.
        let mut data = ConfigData::default();
        data.download_interval_minutes = 15;
        std::fs::write(&path, data.to_json().unwrap()).unwrap();

        assert_eq!(config.sync_interval().unwrap(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_interval_validation() {
        let temp = TempDir::new().unwrap();
        let config = FileConfig::open(temp.path().join(CONFIG_FILENAME)).unwrap();

        assert!(matches!(config.set_interval_minutes(0), Err(Error::Config(_))));
        assert!(config.set_interval_minutes(-3).is_err());
        config.set_interval_minutes(2).unwrap();
        assert_eq!(config.sync_interval().unwrap(), Duration::from_secs(120));

        let mut data = config.load().unwrap();
        data.download_interval_minutes = 0;
        std::fs::write(config.path(), data.to_json().unwrap()).unwrap();
        assert!(matches!(config.sync_interval(), Err(Error::Config(_))));
    }

    #[test]
    fn test_oversized_interval_is_a_config_error() {
        let temp = TempDir::new().unwrap();
        let config = FileConfig::open(temp.path().join(CONFIG_FILENAME)).unwrap();

        assert!(matches!(
            config.set_interval_minutes(i64::MAX),
            Err(Error::Config(_))
        ));
        assert_eq!(config.load().unwrap().download_interval_minutes, 5);

        let mut data = config.load().unwrap();
        data.download_interval_minutes = i64::MAX;
        std::fs::write(config.path(), data.to_json().unwrap()).unwrap();
        assert!(matches!(config.sync_interval(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let temp = TempDir::new().unwrap();
        let config = FileConfig::open(temp.path().join(CONFIG_FILENAME)).unwrap();
        config.set_credentials("ana", "secret").unwrap();

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![CONFIG_FILENAME.to_string()]);
    }

    #[test]
    fn test_concurrent_writer_never_exposes_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILENAME);
        let writer = FileConfig::open(&path).unwrap();
        writer.set_credentials("ana", "secret").unwrap();

        // Separate instances behave like separate processes: no shared guard.
        let reader = FileConfig::open(&path).unwrap();
        let handle = std::thread::spawn(move || {
            for i in 0..200 {
                writer
                    .set_api_url(&format!("http://host-{}.example/api", i))
                    .unwrap();
            }
        });

        for _ in 0..200 {
            let credentials = reader.credentials().unwrap();
            assert_eq!(credentials.username, "ana");
        }
        handle.join().unwrap();
        assert_eq!(reader.credentials().unwrap().username, "ana");
    }

    #[tokio::test]
    async fn test_read_config_on_blocking_pool() {
        let temp = TempDir::new().unwrap();
        let config: Arc<dyn ConfigSource> =
            Arc::new(FileConfig::open(temp.path().join(CONFIG_FILENAME)).unwrap());

        let interval = read_config(&config, |c| c.sync_interval()).await.unwrap();
        assert_eq!(interval, Duration::from_secs(300));
        assert!(read_config(&config, |c| c.credentials()).await.is_err());
    }

    #[test]
    fn test_ping_url_gets_scheme() {
        let config = MemoryConfig::default();
        assert_eq!(
            config.ping_url().unwrap(),
            "https://apitechsolutions.duckdns.org"
        );
        config.update(|data| data.ping = "http://localhost:9000/health".to_string());
        assert_eq!(config.ping_url().unwrap(), "http://localhost:9000/health");
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("admin", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }
}
