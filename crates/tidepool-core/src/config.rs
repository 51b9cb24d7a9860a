//! Pool file parser and profile resolution.
//!
//! ```toml
//! [defaults]
//! max_pool_size = 50
//! idle_timeout = "300s"
//!
//! [profiles.orders]
//! driver = "postgres"
//! url = "postgres://db.local:5432/orders"
//! username = "app"
//! password = "secret"
//! step_size = 5
//! ```
//!
//! Sizing values resolve profile → `[defaults]` → built-in default.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

pub const DEFAULT_STEP_SIZE: usize = 10;
pub const DEFAULT_MIN_POOL_SIZE: usize = 10;
pub const DEFAULT_MAX_POOL_SIZE: usize = 200;
pub const DEFAULT_INITIAL_POOL_SIZE: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_REAPER_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Which size the idle reaper refuses to shrink a pool below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShrinkFloor {
    /// Never reap below `initial_pool_size`.
    #[default]
    Initial,
    /// Never reap below `min_pool_size`.
    Minimum,
}

impl fmt::Display for ShrinkFloor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShrinkFloor::Initial => write!(f, "initial"),
            ShrinkFloor::Minimum => write!(f, "minimum"),
        }
    }
}

/// Top-level pool file: shared defaults plus named profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolFile {
    #[serde(default)]
    pub defaults: SizingConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

/// Sizing and timing knobs. Every field is optional so that a profile can
/// override only what it needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaper_initial_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shrink_floor: Option<ShrinkFloor>,
}

/// One `[profiles.<name>]` table.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(flatten)]
    pub sizing: SizingConfig,
}

impl fmt::Debug for ProfileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileConfig")
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("sizing", &self.sizing)
            .finish()
    }
}

impl PoolFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pool file {}", path.display()))?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Names of all profiles declared in the file.
    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a profile into validated settings.
    pub fn settings_for(&self, profile: &str) -> ConfigResult<PoolSettings> {
        let entry = self
            .profiles
            .get(profile)
            .ok_or_else(|| ConfigError::UnknownProfile(profile.to_string()))?;

        let sizing = &entry.sizing;
        let shared = &self.defaults;

        let idle_timeout = match sizing.idle_timeout.as_ref().or(shared.idle_timeout.as_ref()) {
            Some(raw) => parse_duration("idle_timeout", raw)?,
            None => DEFAULT_IDLE_TIMEOUT,
        };
        let reaper_initial_delay = match sizing
            .reaper_initial_delay
            .as_ref()
            .or(shared.reaper_initial_delay.as_ref())
        {
            Some(raw) => parse_duration("reaper_initial_delay", raw)?,
            None => DEFAULT_REAPER_INITIAL_DELAY,
        };

        let settings = PoolSettings {
            driver: required(profile, "driver", &entry.driver)?,
            url: required(profile, "url", &entry.url)?,
            username: required(profile, "username", &entry.username)?,
            password: required(profile, "password", &entry.password)?,
            step_size: sizing
                .step_size
                .or(shared.step_size)
                .unwrap_or(DEFAULT_STEP_SIZE),
            min_pool_size: sizing
                .min_pool_size
                .or(shared.min_pool_size)
                .unwrap_or(DEFAULT_MIN_POOL_SIZE),
            max_pool_size: sizing
                .max_pool_size
                .or(shared.max_pool_size)
                .unwrap_or(DEFAULT_MAX_POOL_SIZE),
            initial_pool_size: sizing
                .initial_pool_size
                .or(shared.initial_pool_size)
                .unwrap_or(DEFAULT_INITIAL_POOL_SIZE),
            idle_timeout,
            reaper_initial_delay,
            shrink_floor: sizing
                .shrink_floor
                .or(shared.shrink_floor)
                .unwrap_or_default(),
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Fully resolved, immutable configuration for one pool.
#[derive(Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Driver name used to look up a connection factory.
    pub driver: String,
    pub url: String,
    pub username: String,
    pub password: String,
    /// Number of connections opened per growth step.
    pub step_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Connections opened when the pool is constructed.
    pub initial_pool_size: usize,
    /// Idle time after which a free connection may be reaped. Also the
    /// reaper period.
    pub idle_timeout: Duration,
    /// Delay before the first reaper pass.
    pub reaper_initial_delay: Duration,
    pub shrink_floor: ShrinkFloor,
}

impl PoolSettings {
    /// Settings for the given target with all sizing at built-in defaults.
    pub fn new(driver: &str, url: &str, username: &str, password: &str) -> Self {
        Self {
            driver: driver.to_string(),
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            step_size: DEFAULT_STEP_SIZE,
            min_pool_size: DEFAULT_MIN_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            initial_pool_size: DEFAULT_INITIAL_POOL_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reaper_initial_delay: DEFAULT_REAPER_INITIAL_DELAY,
            shrink_floor: ShrinkFloor::default(),
        }
    }

    /// Builder method: set min, initial and max sizes plus the growth step.
    pub fn with_sizing(self, min: usize, initial: usize, max: usize, step: usize) -> Self {
        Self {
            min_pool_size: min,
            initial_pool_size: initial,
            max_pool_size: max,
            step_size: step,
            ..self
        }
    }

    /// Builder method: set the idle-release threshold.
    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ..self
        }
    }

    /// Builder method: set the delay before the first reaper pass.
    pub fn with_reaper_initial_delay(self, reaper_initial_delay: Duration) -> Self {
        Self {
            reaper_initial_delay,
            ..self
        }
    }

    /// Builder method: choose the reaping floor.
    pub fn with_shrink_floor(self, shrink_floor: ShrinkFloor) -> Self {
        Self {
            shrink_floor,
            ..self
        }
    }

    /// The size below which reaping never shrinks the pool.
    pub fn floor_size(&self) -> usize {
        match self.shrink_floor {
            ShrinkFloor::Initial => self.initial_pool_size,
            ShrinkFloor::Minimum => self.min_pool_size,
        }
    }

    /// Check `min <= initial <= max`, a non-zero max and step, and a
    /// non-zero idle timeout.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::InvalidSizing(
                "max_pool_size must be at least 1".to_string(),
            ));
        }
        if self.min_pool_size > self.initial_pool_size
            || self.initial_pool_size > self.max_pool_size
        {
            return Err(ConfigError::InvalidSizing(format!(
                "expected min_pool_size ({}) <= initial_pool_size ({}) <= max_pool_size ({})",
                self.min_pool_size, self.initial_pool_size, self.max_pool_size
            )));
        }
        if self.step_size == 0 {
            return Err(ConfigError::InvalidSizing(
                "step_size must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "idle_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for PoolSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSettings")
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("step_size", &self.step_size)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("initial_pool_size", &self.initial_pool_size)
            .field("idle_timeout", &self.idle_timeout)
            .field("reaper_initial_delay", &self.reaper_initial_delay)
            .field("shrink_floor", &self.shrink_floor)
            .finish()
    }
}

fn required(profile: &str, field: &'static str, value: &Option<String>) -> ConfigResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        _ => Err(ConfigError::MissingField {
            profile: profile.to_string(),
            field,
        }),
    }
}

/// Parse `"250ms"`, `"30s"` or `"5m"`.
pub fn parse_duration(field: &'static str, raw: &str) -> ConfigResult<Duration> {
    let s = raw.trim();
    let invalid = || ConfigError::InvalidValue {
        field,
        reason: format!("expected a duration like \"500ms\", \"30s\" or \"5m\", got {raw:?}"),
    };

    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|_| invalid())
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[defaults]
max_pool_size = 50
idle_timeout = "120s"

[profiles.orders]
driver = "postgres"
url = "postgres://db.local:5432/orders"
username = "app"
password = "secret"
step_size = 5

[profiles.reports]
driver = "mysql"
url = "mysql://replica.local:3306/reports"
username = "reader"
password = "hunter2"
initial_pool_size = 2
min_pool_size = 1
shrink_floor = "minimum"
"#;

    #[test]
    fn builtin_defaults() {
        let settings = PoolSettings::new("postgres", "postgres://h/db", "u", "p");
        assert_eq!(settings.step_size, 10);
        assert_eq!(settings.min_pool_size, 10);
        assert_eq!(settings.max_pool_size, 200);
        assert_eq!(settings.initial_pool_size, 10);
        assert_eq!(settings.idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.reaper_initial_delay, Duration::from_secs(1));
        assert_eq!(settings.shrink_floor, ShrinkFloor::Initial);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn profile_overrides_shared_defaults() {
        let file = PoolFile::from_toml_str(SAMPLE).unwrap();
        let orders = file.settings_for("orders").unwrap();
        assert_eq!(orders.driver, "postgres");
        assert_eq!(orders.step_size, 5);
        assert_eq!(orders.max_pool_size, 50);
        assert_eq!(orders.initial_pool_size, 10);
        assert_eq!(orders.idle_timeout, Duration::from_secs(120));

        let reports = file.settings_for("reports").unwrap();
        assert_eq!(reports.step_size, 10);
        assert_eq!(reports.min_pool_size, 1);
        assert_eq!(reports.initial_pool_size, 2);
        assert_eq!(reports.shrink_floor, ShrinkFloor::Minimum);
        assert_eq!(reports.floor_size(), 1);
    }

    #[test]
    fn profile_names_sorted() {
        let file = PoolFile::from_toml_str(SAMPLE).unwrap();
        assert_eq!(file.profile_names(), vec!["orders", "reports"]);
    }

    #[test]
    fn unknown_profile() {
        let file = PoolFile::from_toml_str(SAMPLE).unwrap();
        let err = file.settings_for("missing").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProfile(name) if name == "missing"));
    }

    #[test]
    fn blank_credentials_count_as_missing() {
        let file = PoolFile::from_toml_str(
            r#"
[profiles.code]
driver = "postgres"
url = "postgres://h/db"
username = "   "
password = "p"
"#,
        )
        .unwrap();
        let err = file.settings_for("code").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "username", .. }));
    }

    #[test]
    fn missing_driver_reported() {
        let file = PoolFile::from_toml_str(
            r#"
[profiles.code]
url = "postgres://h/db"
username = "u"
password = "p"
"#,
        )
        .unwrap();
        let err = file.settings_for("code").unwrap_err();
        assert!(err.to_string().contains("'driver'"));
    }

    #[test]
    fn initial_above_max_rejected() {
        let settings = PoolSettings::new("d", "u", "n", "p").with_sizing(1, 20, 10, 5);
        assert!(matches!(settings.validate(), Err(ConfigError::InvalidSizing(_))));
    }

    #[test]
    fn min_above_initial_rejected() {
        let settings = PoolSettings::new("d", "u", "n", "p").with_sizing(5, 2, 10, 5);
        assert!(matches!(settings.validate(), Err(ConfigError::InvalidSizing(_))));
    }

    #[test]
    fn zero_step_rejected() {
        let settings = PoolSettings::new("d", "u", "n", "p").with_sizing(0, 0, 10, 0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_max_rejected() {
        let settings = PoolSettings::new("d", "u", "n", "p").with_sizing(0, 0, 0, 1);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_pool_allowed() {
        let settings = PoolSettings::new("d", "u", "n", "p").with_sizing(0, 0, 3, 1);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.floor_size(), 0);
    }

    #[test]
    fn zero_idle_timeout_rejected() {
        let settings =
            PoolSettings::new("d", "u", "n", "p").with_idle_timeout(Duration::ZERO);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { field: "idle_timeout", .. })
        ));
    }

    #[test]
    fn invalid_sizing_in_file_fails_resolution() {
        let file = PoolFile::from_toml_str(
            r#"
[profiles.code]
driver = "postgres"
url = "postgres://h/db"
username = "u"
password = "p"
initial_pool_size = 300
"#,
        )
        .unwrap();
        assert!(matches!(
            file.settings_for("code"),
            Err(ConfigError::InvalidSizing(_))
        ));
    }

    #[test]
    fn parse_durations() {
        assert_eq!(parse_duration("t", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("t", "30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("t", " 5m ").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("t", "30").is_err());
        assert!(parse_duration("t", "fast").is_err());
    }

    #[test]
    fn bad_duration_in_file() {
        let file = PoolFile::from_toml_str(
            r#"
[defaults]
idle_timeout = "soon"

[profiles.code]
driver = "postgres"
url = "postgres://h/db"
username = "u"
password = "p"
"#,
        )
        .unwrap();
        let err = file.settings_for("code").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "idle_timeout", .. }));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = PoolFile::from_toml_str("[profiles.code\ndriver = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn debug_redacts_password() {
        let settings = PoolSettings::new("d", "u", "n", "topsecret");
        assert!(!format!("{settings:?}").contains("topsecret"));

        let file = PoolFile::from_toml_str(SAMPLE).unwrap();
        assert!(!format!("{file:?}").contains("hunter2"));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidepool.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let file = PoolFile::from_file(&path).unwrap();
        assert_eq!(file.profiles.len(), 2);
    }

    #[test]
    fn from_file_missing_path_has_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = PoolFile::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("reading pool file"));
    }
}
