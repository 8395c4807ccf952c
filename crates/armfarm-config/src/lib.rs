// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-config
//!
//! This crate provides [`ArmfarmConfig`] — the top-level runtime settings
//! for the armfarm master — together with helpers for loading from TOML
//! files, applying environment overrides, validating, and merging
//! overlays.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The architect's poll interval is unusually short, which will hammer
    /// the oracle with `ALLPKGS`/`ALLVERS` queries.
    ShortPollInterval {
        /// The configured interval, in seconds.
        secs: u64,
    },
    /// The slave building timeout is not comfortably larger than the idle
    /// timeout, which risks reaping slaves mid-build.
    NarrowTimeoutMargin {
        /// Configured idle timeout, in seconds.
        idle_secs: u64,
        /// Configured building timeout, in seconds.
        building_secs: u64,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ShortPollInterval { secs } => {
                write!(f, "architect poll interval is only {secs}s")
            }
            ConfigWarning::NarrowTimeoutMargin {
                idle_secs,
                building_secs,
            } => write!(
                f,
                "building timeout ({building_secs}s) is not comfortably larger than idle timeout ({idle_secs}s)"
            ),
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the armfarm master.
///
/// Every item here corresponds to an entry in the configuration surface:
/// database connection, bind addresses for the two wire protocols, internal
/// mesh queue capacities, the architect's poll cadence, and the slave
/// timeout pair.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ArmfarmConfig {
    /// Postgres connection string for the database oracle.
    #[serde(default = "default_database_dsn")]
    pub database_dsn: String,

    /// Root directory of the published static index tree.
    #[serde(default = "default_output_path")]
    pub output_path: String,

    /// Bind address for the slave lifecycle protocol (req/rep).
    #[serde(default = "default_slave_bind")]
    pub slave_bind: String,

    /// Bind address for the file-upload protocol (dealer/router).
    #[serde(default = "default_file_bind")]
    pub file_bind: String,

    /// High-water mark on concurrently accepted connections per listener
    /// (slave lifecycle and file upload both). Once this many connections
    /// are open at once, the listener's accept loop suspends until one
    /// closes — the TCP+JSONL substitute for the ZMQ HWM/backpressure
    /// contract spec.md §4.1 describes for push/dealer queues.
    #[serde(default = "default_connection_high_water_mark")]
    pub connection_high_water_mark: usize,

    /// Front-facing bind address Seraph accepts oracle client connections
    /// on.
    #[serde(default = "default_oracle_front_bind")]
    pub oracle_front_bind: String,

    /// Number of oracle worker tasks Seraph fans requests out to. Each
    /// worker holds its own `Oracle` handle (a cheap `PgPool` clone) and
    /// drains its channel strictly one request at a time, so this is the
    /// degree of write concurrency the single-writer rule still allows.
    #[serde(default = "default_oracle_worker_count")]
    pub oracle_worker_count: usize,

    /// Capacity of the bounded in-process channel carrying build targets
    /// from the architect to the slave driver.
    #[serde(default = "default_build_queue_capacity")]
    pub build_queue_capacity: usize,

    /// Capacity of the bounded in-process channel carrying index-update
    /// requests to the scribe.
    #[serde(default = "default_index_queue_capacity")]
    pub index_queue_capacity: usize,

    /// Capacity of the broadcast channel carrying the supervisor's `QUIT`
    /// signal to every task.
    #[serde(default = "default_control_queue_capacity")]
    pub control_queue_capacity: usize,

    /// How often the architect polls the oracle for buildable pairs, in
    /// seconds.
    #[serde(default = "default_architect_poll_secs")]
    pub architect_poll_secs: u64,

    /// Seconds of silence tolerated from an idle slave before it is reaped.
    #[serde(default = "default_slave_idle_timeout_secs")]
    pub slave_idle_timeout_secs: u64,

    /// Seconds of silence tolerated from a building or sending slave before
    /// it is reaped.
    #[serde(default = "default_slave_building_timeout_secs")]
    pub slave_building_timeout_secs: u64,

    /// Maximum number of chunk retries the juggler allows before a file
    /// transfer is abandoned.
    #[serde(default = "default_file_retry_limit")]
    pub file_retry_limit: u32,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

fn default_database_dsn() -> String {
    "postgres://armfarm@localhost/armfarm".into()
}
fn default_output_path() -> String {
    "/var/www/armfarm".into()
}
fn default_slave_bind() -> String {
    "0.0.0.0:5555".into()
}
fn default_file_bind() -> String {
    "0.0.0.0:5556".into()
}
fn default_connection_high_water_mark() -> usize {
    64
}
fn default_oracle_front_bind() -> String {
    "127.0.0.1:5557".into()
}
fn default_oracle_worker_count() -> usize {
    4
}
fn default_build_queue_capacity() -> usize {
    64
}
fn default_index_queue_capacity() -> usize {
    64
}
fn default_control_queue_capacity() -> usize {
    16
}
fn default_architect_poll_secs() -> u64 {
    60
}
fn default_slave_idle_timeout_secs() -> u64 {
    600
}
fn default_slave_building_timeout_secs() -> u64 {
    3_600
}
fn default_file_retry_limit() -> u32 {
    3
}

impl Default for ArmfarmConfig {
    fn default() -> Self {
        Self {
            database_dsn: default_database_dsn(),
            output_path: default_output_path(),
            slave_bind: default_slave_bind(),
            file_bind: default_file_bind(),
            connection_high_water_mark: default_connection_high_water_mark(),
            oracle_front_bind: default_oracle_front_bind(),
            oracle_worker_count: default_oracle_worker_count(),
            build_queue_capacity: default_build_queue_capacity(),
            index_queue_capacity: default_index_queue_capacity(),
            control_queue_capacity: default_control_queue_capacity(),
            architect_poll_secs: default_architect_poll_secs(),
            slave_idle_timeout_secs: default_slave_idle_timeout_secs(),
            slave_building_timeout_secs: default_slave_building_timeout_secs(),
            file_retry_limit: default_file_retry_limit(),
            log_level: Some("info".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Below this poll interval the architect generates a warning.
const SHORT_POLL_THRESHOLD_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load an [`ArmfarmConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`ArmfarmConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<ArmfarmConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ArmfarmConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`ArmfarmConfig`].
pub fn parse_toml(content: &str) -> Result<ArmfarmConfig, ConfigError> {
    toml::from_str::<ArmfarmConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `ARMFARM_DATABASE_DSN`
/// - `ARMFARM_OUTPUT_PATH`
/// - `ARMFARM_SLAVE_BIND`
/// - `ARMFARM_FILE_BIND`
/// - `ARMFARM_CONNECTION_HIGH_WATER_MARK`
/// - `ARMFARM_ORACLE_FRONT_BIND`
/// - `ARMFARM_ORACLE_WORKER_COUNT`
/// - `ARMFARM_ARCHITECT_POLL_SECS`
/// - `ARMFARM_SLAVE_IDLE_TIMEOUT_SECS`
/// - `ARMFARM_SLAVE_BUILDING_TIMEOUT_SECS`
/// - `ARMFARM_FILE_RETRY_LIMIT`
/// - `ARMFARM_LOG_LEVEL`
pub fn apply_env_overrides(config: &mut ArmfarmConfig) {
    if let Ok(val) = std::env::var("ARMFARM_DATABASE_DSN") {
        config.database_dsn = val;
    }
    if let Ok(val) = std::env::var("ARMFARM_OUTPUT_PATH") {
        config.output_path = val;
    }
    if let Ok(val) = std::env::var("ARMFARM_SLAVE_BIND") {
        config.slave_bind = val;
    }
    if let Ok(val) = std::env::var("ARMFARM_FILE_BIND") {
        config.file_bind = val;
    }
    if let Ok(val) = std::env::var("ARMFARM_CONNECTION_HIGH_WATER_MARK")
        && let Ok(n) = val.parse()
    {
        config.connection_high_water_mark = n;
    }
    if let Ok(val) = std::env::var("ARMFARM_ORACLE_FRONT_BIND") {
        config.oracle_front_bind = val;
    }
    if let Ok(val) = std::env::var("ARMFARM_ORACLE_WORKER_COUNT")
        && let Ok(n) = val.parse()
    {
        config.oracle_worker_count = n;
    }
    if let Ok(val) = std::env::var("ARMFARM_ARCHITECT_POLL_SECS")
        && let Ok(secs) = val.parse()
    {
        config.architect_poll_secs = secs;
    }
    if let Ok(val) = std::env::var("ARMFARM_SLAVE_IDLE_TIMEOUT_SECS")
        && let Ok(secs) = val.parse()
    {
        config.slave_idle_timeout_secs = secs;
    }
    if let Ok(val) = std::env::var("ARMFARM_SLAVE_BUILDING_TIMEOUT_SECS")
        && let Ok(secs) = val.parse()
    {
        config.slave_building_timeout_secs = secs;
    }
    if let Ok(val) = std::env::var("ARMFARM_FILE_RETRY_LIMIT")
        && let Ok(n) = val.parse()
    {
        config.file_retry_limit = n;
    }
    if let Ok(val) = std::env::var("ARMFARM_LOG_LEVEL") {
        config.log_level = Some(val);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (invalid log level, zero-capacity queues, a building timeout
/// not exceeding the idle timeout) are returned as a
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &ArmfarmConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if config.database_dsn.trim().is_empty() {
        errors.push("database_dsn must not be empty".into());
    }

    if config.oracle_worker_count == 0 {
        errors.push("oracle_worker_count must be greater than zero".into());
    }

    if config.connection_high_water_mark == 0 {
        errors.push("connection_high_water_mark must be greater than zero".into());
    }

    if config.build_queue_capacity == 0 {
        errors.push("build_queue_capacity must be greater than zero".into());
    }
    if config.index_queue_capacity == 0 {
        errors.push("index_queue_capacity must be greater than zero".into());
    }
    if config.control_queue_capacity == 0 {
        errors.push("control_queue_capacity must be greater than zero".into());
    }

    if config.architect_poll_secs == 0 {
        errors.push("architect_poll_secs must be greater than zero".into());
    } else if config.architect_poll_secs < SHORT_POLL_THRESHOLD_SECS {
        warnings.push(ConfigWarning::ShortPollInterval {
            secs: config.architect_poll_secs,
        });
    }

    if config.slave_idle_timeout_secs == 0 {
        errors.push("slave_idle_timeout_secs must be greater than zero".into());
    }
    if config.slave_building_timeout_secs == 0 {
        errors.push("slave_building_timeout_secs must be greater than zero".into());
    }
    if config.slave_building_timeout_secs <= config.slave_idle_timeout_secs {
        errors.push(format!(
            "slave_building_timeout_secs ({}) must exceed slave_idle_timeout_secs ({})",
            config.slave_building_timeout_secs, config.slave_idle_timeout_secs
        ));
    } else if config.slave_building_timeout_secs < config.slave_idle_timeout_secs * 2 {
        warnings.push(ConfigWarning::NarrowTimeoutMargin {
            idle_secs: config.slave_idle_timeout_secs,
            building_secs: config.slave_building_timeout_secs,
        });
    }

    if config.file_retry_limit == 0 {
        errors.push("file_retry_limit must be greater than zero".into());
    }

    if config.output_path.trim().is_empty() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "output_path".into(),
            hint: "the index tree will be written relative to the working directory".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Every field in `overlay` wins except where the
/// field still holds its type's `Default`-equivalent baseline, in which
/// case `base`'s value is kept.
///
/// Unlike a map of named backends, every field here is a scalar, so merging
/// is simply "prefer overlay, else base" per field — `log_level` is the
/// only genuinely optional field and follows `Option::or` semantics.
#[must_use]
pub fn merge_configs(base: ArmfarmConfig, overlay: ArmfarmConfig) -> ArmfarmConfig {
    let default = ArmfarmConfig::default();
    ArmfarmConfig {
        database_dsn: pick(overlay.database_dsn, base.database_dsn, &default.database_dsn),
        output_path: pick(overlay.output_path, base.output_path, &default.output_path),
        slave_bind: pick(overlay.slave_bind, base.slave_bind, &default.slave_bind),
        file_bind: pick(overlay.file_bind, base.file_bind, &default.file_bind),
        connection_high_water_mark: pick_scalar(
            overlay.connection_high_water_mark,
            base.connection_high_water_mark,
            default.connection_high_water_mark,
        ),
        oracle_front_bind: pick(
            overlay.oracle_front_bind,
            base.oracle_front_bind,
            &default.oracle_front_bind,
        ),
        oracle_worker_count: pick_scalar(
            overlay.oracle_worker_count,
            base.oracle_worker_count,
            default.oracle_worker_count,
        ),
        build_queue_capacity: pick_scalar(
            overlay.build_queue_capacity,
            base.build_queue_capacity,
            default.build_queue_capacity,
        ),
        index_queue_capacity: pick_scalar(
            overlay.index_queue_capacity,
            base.index_queue_capacity,
            default.index_queue_capacity,
        ),
        control_queue_capacity: pick_scalar(
            overlay.control_queue_capacity,
            base.control_queue_capacity,
            default.control_queue_capacity,
        ),
        architect_poll_secs: pick_scalar(
            overlay.architect_poll_secs,
            base.architect_poll_secs,
            default.architect_poll_secs,
        ),
        slave_idle_timeout_secs: pick_scalar(
            overlay.slave_idle_timeout_secs,
            base.slave_idle_timeout_secs,
            default.slave_idle_timeout_secs,
        ),
        slave_building_timeout_secs: pick_scalar(
            overlay.slave_building_timeout_secs,
            base.slave_building_timeout_secs,
            default.slave_building_timeout_secs,
        ),
        file_retry_limit: pick_scalar(
            overlay.file_retry_limit,
            base.file_retry_limit,
            default.file_retry_limit,
        ),
        log_level: overlay.log_level.or(base.log_level),
    }
}

fn pick(overlay: String, base: String, default: &str) -> String {
    if overlay != default { overlay } else { base }
}

fn pick_scalar<T: PartialEq + Copy>(overlay: T, base: T, default: T) -> T {
    if overlay != default { overlay } else { base }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let cfg = ArmfarmConfig::default();
        validate_config(&cfg).expect("default config should be valid");
    }

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = ArmfarmConfig::default();
        assert_eq!(cfg.slave_bind, "0.0.0.0:5555");
        assert_eq!(cfg.file_bind, "0.0.0.0:5556");
        assert_eq!(cfg.connection_high_water_mark, 64);
        assert_eq!(cfg.slave_idle_timeout_secs, 600);
        assert_eq!(cfg.slave_building_timeout_secs, 3_600);
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml_str = r#"
            database_dsn = "postgres://u@h/db"
            slave_bind = "0.0.0.0:9999"
            architect_poll_secs = 30
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.database_dsn, "postgres://u@h/db");
        assert_eq!(cfg.slave_bind, "0.0.0.0:9999");
        assert_eq!(cfg.architect_poll_secs, 30);
        // untouched fields still carry their serde defaults
        assert_eq!(cfg.file_bind, "0.0.0.0:5556");
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let cfg = ArmfarmConfig {
            log_level: Some("verbose".into()),
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_building_timeout_not_exceeding_idle() {
        let cfg = ArmfarmConfig {
            slave_idle_timeout_secs: 600,
            slave_building_timeout_secs: 600,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("must exceed")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_zero_oracle_worker_count() {
        let cfg = ArmfarmConfig {
            oracle_worker_count: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_connection_high_water_mark() {
        let cfg = ArmfarmConfig {
            connection_high_water_mark: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_queue_capacity() {
        let cfg = ArmfarmConfig {
            build_queue_capacity: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn narrow_timeout_margin_produces_warning() {
        let cfg = ArmfarmConfig {
            slave_idle_timeout_secs: 600,
            slave_building_timeout_secs: 900,
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::NarrowTimeoutMargin { .. }))
        );
    }

    #[test]
    fn short_poll_interval_produces_warning() {
        let cfg = ArmfarmConfig {
            architect_poll_secs: 2,
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::ShortPollInterval { .. }))
        );
    }

    #[test]
    fn merge_overlay_overrides_base() {
        let base = ArmfarmConfig {
            database_dsn: "postgres://base/db".into(),
            ..Default::default()
        };
        let overlay = ArmfarmConfig {
            database_dsn: "postgres://overlay/db".into(),
            ..Default::default()
        };
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.database_dsn, "postgres://overlay/db");
    }

    #[test]
    fn merge_preserves_base_when_overlay_is_default() {
        let base = ArmfarmConfig {
            slave_bind: "0.0.0.0:7777".into(),
            ..Default::default()
        };
        let merged = merge_configs(base.clone(), ArmfarmConfig::default());
        assert_eq!(merged.slave_bind, "0.0.0.0:7777");
    }

    #[test]
    fn empty_string_toml_parses_to_defaults() {
        let cfg = parse_toml("").unwrap();
        assert_eq!(cfg, ArmfarmConfig::default());
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = ArmfarmConfig {
            database_dsn: "postgres://u@h/db".into(),
            ..Default::default()
        };
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: ArmfarmConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("armfarm.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "database_dsn = \"postgres://x/y\"\nlog_level = \"warn\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.database_dsn, "postgres://x/y");
        assert_eq!(cfg.log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/armfarm.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg, {
            let mut d = ArmfarmConfig::default();
            apply_env_overrides(&mut d);
            d
        });
    }

    #[test]
    fn config_error_display() {
        let e = ConfigError::FileNotFound { path: "/foo".into() };
        assert!(e.to_string().contains("/foo"));
    }

    #[test]
    fn config_warning_display() {
        let w = ConfigWarning::ShortPollInterval { secs: 1 };
        assert!(w.to_string().contains('1'));

        let w = ConfigWarning::NarrowTimeoutMargin {
            idle_secs: 600,
            building_secs: 900,
        };
        let s = w.to_string();
        assert!(s.contains("600"));
        assert!(s.contains("900"));
    }
}
