use crate::error::{Result, WriterError};
use bytesize::ByteSize;
use journal_common::time::USEC_PER_MONTH;
use journal_core::Compression;
use journal_core::file::JournalMetrics;
use std::path::PathBuf;
use std::time::Duration;

/// Controls when the active files are rotated.
///
/// A file also rotates when its hash tables fill up or its header is
/// outdated, whatever the policy says.
#[derive(Debug, Copy, Clone)]
pub struct RotationPolicy {
    /// Maximum size of a single file
    pub max_file_size: Option<u64>,
    /// Smallest size a file is allowed to grow to before it can be considered full
    pub min_file_size: Option<u64>,
    /// Maximum time span between the first entry of a file and now
    pub max_file_age: Option<Duration>,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_file_size: None,
            min_file_size: None,
            max_file_age: Some(Duration::from_micros(USEC_PER_MONTH)),
        }
    }
}

impl RotationPolicy {
    /// Specifies the maximum journal file size.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = Some(max_file_size);
        self
    }

    pub fn with_min_file_size(mut self, min_file_size: u64) -> Self {
        self.min_file_size = Some(min_file_size);
        self
    }

    /// Specifies the maximum age of the active file. `None` disables the check.
    pub fn with_max_file_age(mut self, max_file_age: Option<Duration>) -> Self {
        self.max_file_age = max_file_age;
        self
    }
}

/// Controls when archived files are deleted.
///
/// Unset byte limits are derived from the size of the filesystem holding
/// the journal directory.
#[derive(Debug, Copy, Clone, Default)]
pub struct RetentionPolicy {
    /// Maximum disk space all files of the directory may use
    pub max_use: Option<u64>,
    /// Space that is always granted, even when the filesystem is tight
    pub min_use: Option<u64>,
    /// Space to leave free for other users of the filesystem
    pub keep_free: Option<u64>,
    /// Maximum number of archived files to keep
    pub max_files: Option<u64>,
    /// Archived files whose last write is older than this are deleted
    pub max_retention: Option<Duration>,
}

impl RetentionPolicy {
    pub fn with_max_use(mut self, max_use: u64) -> Self {
        self.max_use = Some(max_use);
        self
    }

    pub fn with_min_use(mut self, min_use: u64) -> Self {
        self.min_use = Some(min_use);
        self
    }

    pub fn with_keep_free(mut self, keep_free: u64) -> Self {
        self.keep_free = Some(keep_free);
        self
    }

    pub fn with_max_files(mut self, max_files: u64) -> Self {
        self.max_files = Some(max_files);
        self
    }

    pub fn with_max_retention(mut self, max_retention: Duration) -> Self {
        self.max_retention = Some(max_retention);
        self
    }
}

/// Suppression of message floods, applied per priority group.
///
/// Both values must be non-zero for rate limiting to be active.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub interval: Duration,
    pub burst: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            burst: 200,
        }
    }
}

impl RateLimitPolicy {
    pub fn disabled() -> Self {
        Self {
            interval: Duration::ZERO,
            burst: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero() && self.burst > 0
    }

    /// A policy with only one of the two limits set is turned off.
    fn normalized(self) -> Self {
        if self.interval.is_zero() != (self.burst == 0) {
            tracing::debug!(
                "disabling rate limiting, interval={:?} burst={}",
                self.interval,
                self.burst
            );
            return Self::disabled();
        }
        self
    }
}

/// How entries are spread over the files of the directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SplitMode {
    /// Entries of regular users go to a per-user file
    #[default]
    Uid,
    /// Everything goes to the system file
    None,
}

/// Highest numeric uid that still counts as a system user.
pub const SYSTEM_UID_MAX: u32 = 999;

/// Configuration for a journal directory and its writer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one subdirectory per machine id
    pub directory: PathBuf,
    /// Overrides `/etc/machine-id`
    pub machine_id: Option<uuid::Uuid>,
    /// Overrides the kernel's boot id
    pub boot_id: Option<uuid::Uuid>,
    pub rotation_policy: RotationPolicy,
    pub retention_policy: RetentionPolicy,
    pub rate_limit: RateLimitPolicy,
    pub compression: Compression,
    pub keyed_hash: bool,
    pub split_mode: SplitMode,
    /// Entries at or below this priority are synced right away, others
    /// at most this long after being written
    pub sync_interval: Duration,
    /// Entries with a numerically higher priority are discarded
    pub max_level_store: u8,
    /// Number of per-user files kept open at once
    pub user_files_max: usize,
}

impl Config {
    /// Creates a configuration with the default policies.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            machine_id: None,
            boot_id: None,
            rotation_policy: RotationPolicy::default(),
            retention_policy: RetentionPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            compression: Compression::Zstd,
            keyed_hash: true,
            split_mode: SplitMode::default(),
            sync_interval: Duration::from_secs(5 * 60),
            max_level_store: 7,
            user_files_max: 1024,
        }
    }

    pub fn with_machine_id(mut self, machine_id: uuid::Uuid) -> Self {
        self.machine_id = Some(machine_id);
        self
    }

    pub fn with_boot_id(mut self, boot_id: uuid::Uuid) -> Self {
        self.boot_id = Some(boot_id);
        self
    }

    /// Specifies the rotation policy of the log directory
    pub fn with_rotation_policy(mut self, policy: RotationPolicy) -> Self {
        self.rotation_policy = policy;
        self
    }

    /// Specifies the retention policy of the log directory
    pub fn with_retention_policy(mut self, policy: RetentionPolicy) -> Self {
        self.retention_policy = policy;
        self
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy.normalized();
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_keyed_hash(mut self, keyed_hash: bool) -> Self {
        self.keyed_hash = keyed_hash;
        self
    }

    pub fn with_split_mode(mut self, split_mode: SplitMode) -> Self {
        self.split_mode = split_mode;
        self
    }

    pub fn with_sync_interval(mut self, sync_interval: Duration) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    pub fn with_max_level_store(mut self, max_level_store: u8) -> Self {
        self.max_level_store = max_level_store.min(7);
        self
    }

    pub fn with_user_files_max(mut self, user_files_max: usize) -> Self {
        self.user_files_max = user_files_max.max(1);
        self
    }

    /// Size limits in the form the file layer consumes.
    pub fn metrics(&self) -> JournalMetrics {
        JournalMetrics {
            max_use: self.retention_policy.max_use,
            min_use: self.retention_policy.min_use,
            max_size: self.rotation_policy.max_file_size,
            min_size: self.rotation_policy.min_file_size,
            keep_free: self.retention_policy.keep_free,
            n_max_files: self.retention_policy.max_files,
        }
    }

    /// Maximum age of the active file in microseconds, zero when unlimited.
    pub fn max_file_usec(&self) -> u64 {
        self.rotation_policy
            .max_file_age
            .map_or(0, |age| age.as_micros() as u64)
    }

    /// Maximum retention of archived files in microseconds, zero when unlimited.
    pub fn max_retention_usec(&self) -> u64 {
        self.retention_policy
            .max_retention
            .map_or(0, |age| age.as_micros() as u64)
    }

    /// Applies the `Key=Value` lines of a `journald.conf` style text.
    ///
    /// Section headers, blank lines and comments are skipped. Unknown keys
    /// are logged and ignored, malformed values are errors.
    pub fn load_settings(&mut self, text: &str) -> Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(['#', ';', '[']) {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!("ignoring setting without a value: {line}");
                continue;
            };

            self.apply_setting(key.trim(), value.trim())?;
        }

        self.rate_limit = self.rate_limit.normalized();
        Ok(())
    }

    /// Applies one setting by its `journald.conf` name.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "Compress" => {
                self.compression = match value.to_ascii_lowercase().as_str() {
                    "zstd" => Compression::Zstd,
                    "lz4" => Compression::Lz4,
                    _ if parse_bool(key, value)? => Compression::Zstd,
                    _ => Compression::None,
                }
            }
            "KeyedHash" => self.keyed_hash = parse_bool(key, value)?,
            "SplitMode" => {
                self.split_mode = match value {
                    "uid" => SplitMode::Uid,
                    "none" => SplitMode::None,
                    _ => return Err(invalid(key, value, "expected uid or none")),
                }
            }
            "SyncIntervalSec" => self.sync_interval = parse_duration(key, value)?,
            "RateLimitInterval" | "RateLimitIntervalSec" => {
                self.rate_limit.interval = parse_duration(key, value)?
            }
            "RateLimitBurst" => {
                self.rate_limit.burst = value
                    .parse()
                    .map_err(|e| invalid(key, value, format!("{e}")))?
            }
            "SystemMaxUse" => self.retention_policy.max_use = Some(parse_size(key, value)?),
            "SystemMinUse" => self.retention_policy.min_use = Some(parse_size(key, value)?),
            "SystemKeepFree" => self.retention_policy.keep_free = Some(parse_size(key, value)?),
            "SystemMaxFiles" => {
                self.retention_policy.max_files = Some(
                    value
                        .parse()
                        .map_err(|e| invalid(key, value, format!("{e}")))?,
                )
            }
            "SystemMaxFileSize" => {
                self.rotation_policy.max_file_size = Some(parse_size(key, value)?)
            }
            "SystemMinFileSize" => {
                self.rotation_policy.min_file_size = Some(parse_size(key, value)?)
            }
            "MaxRetentionSec" => {
                let age = parse_duration(key, value)?;
                self.retention_policy.max_retention = (!age.is_zero()).then_some(age);
            }
            "MaxFileSec" => {
                let age = parse_duration(key, value)?;
                self.rotation_policy.max_file_age = (!age.is_zero()).then_some(age);
            }
            "MaxLevelStore" => self.max_level_store = parse_level(key, value)?,
            _ => tracing::warn!("unknown setting {key}, ignoring"),
        }

        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> WriterError {
    WriterError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "true" | "on" => Ok(true),
        "0" | "n" | "no" | "false" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

/// Parse a duration string (e.g., "30s", "1 week", "1month"). A bare number is seconds.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|e| invalid(key, value, e.to_string()))
}

/// Parse a size string (e.g., "100MB", "1.5GB", "512MiB"). A bare number is bytes.
fn parse_size(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|e| invalid(key, value, e.to_string()))
}

/// Parses a syslog level given by name or number.
pub fn parse_level(key: &str, value: &str) -> Result<u8> {
    const NAMES: [&str; 8] = [
        "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
    ];

    if let Ok(level) = value.parse::<u8>() {
        if level <= 7 {
            return Ok(level);
        }
    }

    NAMES
        .iter()
        .position(|name| value.eq_ignore_ascii_case(name))
        .map(|level| level as u8)
        .ok_or_else(|| invalid(key, value, "expected a syslog level"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_override_defaults() {
        let mut config = Config::new("/var/log/journal");
        config
            .load_settings(
                "[Journal]\n\
                 # comment\n\
                 Compress=no\n\
                 SplitMode=none\n\
                 SystemMaxUse=100MiB\n\
                 SystemMaxFileSize=8MiB\n\
                 MaxRetentionSec=1week\n\
                 MaxFileSec=0\n\
                 RateLimitInterval=30s\n\
                 RateLimitBurst=1000\n\
                 MaxLevelStore=warning\n\
                 Storage=persistent\n",
            )
            .unwrap();

        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.split_mode, SplitMode::None);
        assert_eq!(config.retention_policy.max_use, Some(100 * 1024 * 1024));
        assert_eq!(config.metrics().max_size, Some(8 * 1024 * 1024));
        assert_eq!(config.max_retention_usec(), 7 * 24 * 3600 * 1_000_000);
        assert_eq!(config.max_file_usec(), 0);
        assert_eq!(
            config.rate_limit,
            RateLimitPolicy {
                interval: Duration::from_secs(30),
                burst: 1000
            }
        );
        assert_eq!(config.max_level_store, 4);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut config = Config::new("/tmp");
        assert!(config.apply_setting("Compress", "maybe").is_err());
        assert!(config.apply_setting("SystemMaxUse", "lots").is_err());
        assert!(config.apply_setting("MaxLevelStore", "9").is_err());
        assert!(config.apply_setting("SplitMode", "login").is_err());
    }

    #[test]
    fn half_configured_rate_limit_is_disabled() {
        let mut config = Config::new("/tmp");
        config.load_settings("RateLimitBurst=0\n").unwrap();
        assert!(!config.rate_limit.is_enabled());
        assert_eq!(config.rate_limit, RateLimitPolicy::disabled());

        let config = Config::new("/tmp").with_rate_limit(RateLimitPolicy {
            interval: Duration::ZERO,
            burst: 10,
        });
        assert!(!config.rate_limit.is_enabled());
    }

    #[test]
    fn levels_parse_by_name_and_number() {
        assert_eq!(parse_level("k", "debug").unwrap(), 7);
        assert_eq!(parse_level("k", "ERR").unwrap(), 3);
        assert_eq!(parse_level("k", "0").unwrap(), 0);
    }
}
