//! Daemon-level configuration: log verbosity, default timeouts, snapshot path.
//!
//! This is deliberately small — the on-disk unit-file grammar and drop-in
//! loader are out of scope; this only covers knobs the job core itself needs
//! to boot.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_job_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/run/unitcore/snapshot")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Default `job_timeout` for units that don't override it.
    #[serde(with = "humantime_serde_secs")]
    pub default_job_timeout: Duration,
    /// Where `Manager::serialize`/`Manager::deserialize` read and write the
    /// reexec snapshot.
    pub snapshot_path: PathBuf,
    /// `RUST_LOG`-style filter applied if the caller doesn't set one in the
    /// environment already.
    pub log_filter: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_job_timeout: default_job_timeout(),
            snapshot_path: default_snapshot_path(),
            log_filter: "info".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Tiny shim so `Duration` round-trips through JSON as whole seconds instead
/// of the serde default `{secs, nanos}` struct — keeps a hand-edited config
/// file readable.
mod humantime_serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = ManagerConfig::default();
        let s = serde_json::to_string(&cfg).unwrap();
        let back = ManagerConfig::from_json_str(&s).unwrap();
        assert_eq!(cfg.default_job_timeout, back.default_job_timeout);
        assert_eq!(cfg.snapshot_path, back.snapshot_path);
    }
}
