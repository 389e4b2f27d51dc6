//! Configuration types.
//!
//! Everything is read from `AUTOPILOT_*` environment variables with
//! defaults suited to a single account running unattended.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default neutral reply used when the policy answers with nothing usable.
pub const DEFAULT_FALLBACK_REPLY: &str = "Thanks for your message! I'll get back to you shortly.";

/// Engine configuration: pacing, burst collection, idle timeout, sweeps.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Account the loop runs for.
    pub account_id: String,
    /// Stop after this long without a state-changing event.
    pub idle_timeout: Duration,
    /// Lower bound of the randomized pause between cycles.
    pub pacing_min: Duration,
    /// Upper bound of the randomized pause between cycles.
    pub pacing_max: Duration,
    /// Interval between transcript reads while a burst settles.
    pub burst_poll_interval: Duration,
    /// Consecutive quiet polls after which a burst counts as settled.
    pub burst_settle_polls: u32,
    /// Hard cap on burst polls.
    pub burst_max_polls: u32,
    /// Extra transcript reads after an empty one.
    pub extraction_retries: u32,
    /// Pause between extraction retries.
    pub extraction_retry_delay: Duration,
    /// Contacts active within this window are polled every cycle.
    pub active_window: Duration,
    /// WAITING/ENDED contacts idle longer than this get archived.
    pub archive_after: Duration,
    /// Reply sent when the policy returns empty or garbled text.
    pub fallback_reply: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            idle_timeout: Duration::from_secs(1800), // 30 minutes
            pacing_min: Duration::from_secs(4),
            pacing_max: Duration::from_secs(9),
            burst_poll_interval: Duration::from_secs(2),
            burst_settle_polls: 3,
            burst_max_polls: 15,
            extraction_retries: 3,
            extraction_retry_delay: Duration::from_secs(1),
            active_window: Duration::from_secs(2 * 3600),
            archive_after: Duration::from_secs(14 * 24 * 3600),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }
}

impl EngineConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let pacing_min = env_secs("AUTOPILOT_PACING_MIN_SECS", defaults.pacing_min)?;
        let pacing_max = env_secs("AUTOPILOT_PACING_MAX_SECS", defaults.pacing_max)?;
        if pacing_max < pacing_min {
            return Err(ConfigError::InvalidValue {
                key: "AUTOPILOT_PACING_MAX_SECS".into(),
                message: "must be >= AUTOPILOT_PACING_MIN_SECS".into(),
            });
        }

        Ok(Self {
            account_id: std::env::var("AUTOPILOT_ACCOUNT_ID").unwrap_or(defaults.account_id),
            idle_timeout: env_secs("AUTOPILOT_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            pacing_min,
            pacing_max,
            burst_poll_interval: env_millis(
                "AUTOPILOT_BURST_POLL_MS",
                defaults.burst_poll_interval,
            )?,
            burst_settle_polls: env_parse("AUTOPILOT_BURST_SETTLE_POLLS", defaults.burst_settle_polls)?,
            burst_max_polls: env_parse("AUTOPILOT_BURST_MAX_POLLS", defaults.burst_max_polls)?,
            extraction_retries: env_parse(
                "AUTOPILOT_EXTRACTION_RETRIES",
                defaults.extraction_retries,
            )?,
            extraction_retry_delay: env_millis(
                "AUTOPILOT_EXTRACTION_RETRY_MS",
                defaults.extraction_retry_delay,
            )?,
            active_window: env_secs("AUTOPILOT_ACTIVE_WINDOW_SECS", defaults.active_window)?,
            archive_after: env_secs("AUTOPILOT_ARCHIVE_AFTER_SECS", defaults.archive_after)?,
            fallback_reply: std::env::var("AUTOPILOT_FALLBACK_REPLY")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.fallback_reply),
        })
    }
}

/// Connection settings for the browser-automation sidecar.
#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl SurfaceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("AUTOPILOT_SURFACE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("AUTOPILOT_SURFACE_URL".into()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: env_secs("AUTOPILOT_SURFACE_TIMEOUT_SECS", Duration::from_secs(30))?,
        })
    }
}

/// Connection settings for the reply policy service.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

impl PolicyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = std::env::var("AUTOPILOT_POLICY_URL")
            .map_err(|_| ConfigError::MissingEnvVar("AUTOPILOT_POLICY_URL".into()))?;
        Ok(Self {
            endpoint,
            api_key: std::env::var("AUTOPILOT_POLICY_API_KEY")
                .ok()
                .map(SecretString::from),
            timeout: env_secs("AUTOPILOT_POLICY_TIMEOUT_SECS", Duration::from_secs(60))?,
        })
    }
}

/// Where session problems are escalated.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    /// Webhook receiving JSON alerts. `None` means log only.
    pub webhook_url: Option<String>,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        Self {
            webhook_url: std::env::var("AUTOPILOT_NOTIFY_WEBHOOK")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Database file location (`AUTOPILOT_DB_PATH`).
pub fn database_path() -> std::path::PathBuf {
    std::env::var("AUTOPILOT_DB_PATH")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "./data/autopilot.db".to_string())
        .into()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}
