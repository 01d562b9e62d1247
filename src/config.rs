use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, built once at startup and passed to the
/// components that need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding the engine's WAL. `None` runs in memory.
    pub data_dir: Option<PathBuf>,
    /// Collection holding one document per asset.
    pub collection: String,
    /// Upper bound on a single document store call.
    pub store_timeout: Duration,
    pub booking_id_len: usize,
    pub access_token_len: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            collection: "cars".into(),
            store_timeout: Duration::from_millis(5000),
            booking_id_len: 8,
            access_token_len: 32,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Read `FLEETBOOK_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to
    /// the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            data_dir: lookup("FLEETBOOK_DATA_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            collection: lookup("FLEETBOOK_COLLECTION")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.collection),
            store_timeout: parsed("FLEETBOOK_STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            booking_id_len: parsed("FLEETBOOK_BOOKING_ID_LEN")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.booking_id_len),
            access_token_len: parsed("FLEETBOOK_ACCESS_TOKEN_LEN")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.access_token_len),
            compact_threshold: parsed("FLEETBOOK_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            compact_interval: parsed("FLEETBOOK_COMPACT_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.compact_interval),
        }
    }

    /// WAL file for the document engine, when persistence is configured.
    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.wal", self.collection)))
    }
}
