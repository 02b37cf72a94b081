//! Room service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::capacity::Tier;
use common::secret::{self, SecretString};
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3001";

/// Default allowed CORS origin (the web client's dev server).
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";

/// Default session token lifetime (24 hours).
pub const DEFAULT_SESSION_TOKEN_TTL_SECONDS: u64 = 86_400;

/// Bounds for the session token lifetime.
pub const MIN_SESSION_TOKEN_TTL_SECONDS: u64 = 60;
pub const MAX_SESSION_TOKEN_TTL_SECONDS: u64 = 604_800;

/// Minimum signing key length for session tokens (HS256).
pub const MIN_JWT_SECRET_BYTES: usize = 32;

/// Default bcrypt cost for room passwords.
pub const DEFAULT_PASSWORD_HASH_COST: u32 = 10;

/// Accepted bcrypt cost range. Low costs are only meant for test rigs.
pub const MIN_PASSWORD_HASH_COST: u32 = 4;
pub const MAX_PASSWORD_HASH_COST: u32 = 14;

/// Default total room capacity shared by all tiers.
pub const DEFAULT_TOTAL_MAX_ROOMS: u32 = 50;

/// Default share of total capacity for free rooms.
pub const DEFAULT_FREE_POOL_PERCENT: u32 = 60;

/// Default share of total capacity for supporter rooms.
pub const DEFAULT_SUPPORTER_POOL_PERCENT: u32 = 30;

/// Default number of media worker instances when no parallelism hint exists.
pub const DEFAULT_MEDIA_WORKERS: usize = 1;

pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;
pub const DEFAULT_RTC_MIN_PORT: u16 = 40_000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49_999;

/// Delay between a media worker dying and the process exiting.
pub const DEFAULT_WORKER_DEATH_EXIT_DELAY_MS: u64 = 2_000;

pub const DEFAULT_WS_KEEPALIVE_INTERVAL_SECONDS: u64 = 25;
pub const DEFAULT_WS_KEEPALIVE_TIMEOUT_SECONDS: u64 = 60;

/// Maximum chat message length in characters.
pub const DEFAULT_CHAT_MAX_LENGTH: usize = 2_000;

/// Maximum serialized size of relayed key-exchange material.
pub const DEFAULT_KEY_MATERIAL_MAX_BYTES: usize = 16_384;

/// Per-connection outbound frame queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// How long an admitted peer may go without binding a connection.
pub const DEFAULT_PENDING_PEER_TIMEOUT_SECONDS: u64 = 60;

/// Maximum room lifetime (3 hours). Zero disables the limit.
pub const DEFAULT_ROOM_MAX_DURATION_SECONDS: u64 = 10_800;

pub const DEFAULT_HOUSEKEEPING_INTERVAL_SECONDS: u64 = 5;

/// Limits applied to every room of a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierLimits {
    pub max_participants: usize,
    pub max_screen_shares: usize,
    pub max_bitrate: u32,
    pub max_quality: String,
}

/// Tier limits for both service levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierTable {
    pub free: TierLimits,
    pub supporter: TierLimits,
}

impl TierTable {
    /// Limits for the given tier.
    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Supporter => &self.supporter,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimits {
                max_participants: 4,
                max_screen_shares: 1,
                max_bitrate: 1_500_000,
                max_quality: "720p".to_string(),
            },
            supporter: TierLimits {
                max_participants: 10,
                max_screen_shares: 3,
                max_bitrate: 4_000_000,
                max_quality: "1080p".to_string(),
            },
        }
    }
}

/// Capacity split between tiers. Percentages may sum to less than 100;
/// the remainder is an uncommitted reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityConfig {
    pub total_max_rooms: u32,
    pub free_percent: u32,
    pub supporter_percent: u32,
}

/// Media engine settings.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub num_workers: usize,
    pub initial_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub announced_address: Option<String>,
    pub worker_death_exit_delay: Duration,
}

/// Signaling connection settings.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub chat_max_length: usize,
    pub key_material_max_bytes: usize,
    pub outbound_queue_capacity: usize,
}

/// Registry housekeeping settings.
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    pub interval: Duration,
    pub pending_peer_timeout: Duration,
    /// `None` disables room expiry.
    pub room_max_duration: Option<Duration>,
}

/// Room service configuration.
#[derive(Clone)]
pub struct Config {
    /// HTTP and WebSocket bind address (default: "0.0.0.0:3001").
    pub bind_address: String,

    /// Allowed CORS origin; `*` allows any.
    pub cors_origin: String,

    /// HS256 signing key for session tokens.
    /// Protected by `SecretString` to prevent accidental logging.
    pub jwt_secret: SecretString,

    /// Session token lifetime in seconds.
    pub session_token_ttl_seconds: u64,

    /// bcrypt cost for room passwords.
    pub password_hash_cost: u32,

    pub capacity: CapacityConfig,

    pub tiers: TierTable,

    pub media: MediaConfig,

    pub signaling: SignalingConfig,

    pub housekeeping: HousekeepingConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("cors_origin", &self.cors_origin)
            .field("jwt_secret", &"[REDACTED]")
            .field("session_token_ttl_seconds", &self.session_token_ttl_seconds)
            .field("password_hash_cost", &self.password_hash_cost)
            .field("capacity", &self.capacity)
            .field("tiers", &self.tiers)
            .field("media", &self.media)
            .field("signaling", &self.signaling)
            .field("housekeeping", &self.housekeeping)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} has an invalid value"))),
    }
}

fn check_range<T: PartialOrd + fmt::Display>(
    key: &str,
    value: T,
    min: T,
    max: T,
) -> Result<T, ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::InvalidValue(format!(
            "{key} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(value)
}

fn parse_tier_limits(
    vars: &HashMap<String, String>,
    prefix: &str,
    defaults: TierLimits,
) -> Result<TierLimits, ConfigError> {
    let max_participants = parse_var(
        vars,
        &format!("{prefix}_MAX_PARTICIPANTS"),
        defaults.max_participants,
    )?;
    if max_participants == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{prefix}_MAX_PARTICIPANTS must be at least 1"
        )));
    }

    Ok(TierLimits {
        max_participants,
        max_screen_shares: parse_var(
            vars,
            &format!("{prefix}_MAX_SCREEN_SHARES"),
            defaults.max_screen_shares,
        )?,
        max_bitrate: parse_var(vars, &format!("{prefix}_MAX_BITRATE"), defaults.max_bitrate)?,
        max_quality: vars
            .get(&format!("{prefix}_MAX_QUALITY"))
            .cloned()
            .unwrap_or(defaults.max_quality),
    })
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = SecretString::from(
            vars.get("ROOM_JWT_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("ROOM_JWT_SECRET".to_string()))?
                .clone(),
        );
        if !secret::has_min_length(&jwt_secret, MIN_JWT_SECRET_BYTES) {
            return Err(ConfigError::InvalidValue(format!(
                "ROOM_JWT_SECRET must be at least {MIN_JWT_SECRET_BYTES} bytes"
            )));
        }

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let cors_origin = vars
            .get("CORS_ORIGIN")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string());

        let session_token_ttl_seconds = check_range(
            "SESSION_TOKEN_TTL_SECONDS",
            parse_var(
                vars,
                "SESSION_TOKEN_TTL_SECONDS",
                DEFAULT_SESSION_TOKEN_TTL_SECONDS,
            )?,
            MIN_SESSION_TOKEN_TTL_SECONDS,
            MAX_SESSION_TOKEN_TTL_SECONDS,
        )?;

        let password_hash_cost = check_range(
            "PASSWORD_HASH_COST",
            parse_var(vars, "PASSWORD_HASH_COST", DEFAULT_PASSWORD_HASH_COST)?,
            MIN_PASSWORD_HASH_COST,
            MAX_PASSWORD_HASH_COST,
        )?;

        // Capacity split
        let capacity = CapacityConfig {
            total_max_rooms: parse_var(vars, "TOTAL_MAX_ROOMS", DEFAULT_TOTAL_MAX_ROOMS)?,
            free_percent: check_range(
                "FREE_POOL_PERCENT",
                parse_var(vars, "FREE_POOL_PERCENT", DEFAULT_FREE_POOL_PERCENT)?,
                0,
                100,
            )?,
            supporter_percent: check_range(
                "SUPPORTER_POOL_PERCENT",
                parse_var(vars, "SUPPORTER_POOL_PERCENT", DEFAULT_SUPPORTER_POOL_PERCENT)?,
                0,
                100,
            )?,
        };
        if capacity.free_percent + capacity.supporter_percent > 100 {
            return Err(ConfigError::InvalidValue(format!(
                "FREE_POOL_PERCENT + SUPPORTER_POOL_PERCENT must not exceed 100, got {}",
                capacity.free_percent + capacity.supporter_percent
            )));
        }

        let default_tiers = TierTable::default();
        let tiers = TierTable {
            free: parse_tier_limits(vars, "FREE", default_tiers.free)?,
            supporter: parse_tier_limits(vars, "SUPPORTER", default_tiers.supporter)?,
        };

        // Media engine
        let default_workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(DEFAULT_MEDIA_WORKERS);
        let num_workers = parse_var(vars, "MEDIA_WORKERS", default_workers)?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "MEDIA_WORKERS must be at least 1".to_string(),
            ));
        }
        let rtc_min_port = parse_var(vars, "MEDIA_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "MEDIA_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "MEDIA_RTC_MIN_PORT ({rtc_min_port}) must not exceed MEDIA_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }
        let media = MediaConfig {
            num_workers,
            initial_outgoing_bitrate: parse_var(
                vars,
                "MEDIA_INITIAL_OUTGOING_BITRATE",
                DEFAULT_INITIAL_OUTGOING_BITRATE,
            )?,
            max_incoming_bitrate: parse_var(
                vars,
                "MEDIA_MAX_INCOMING_BITRATE",
                DEFAULT_MAX_INCOMING_BITRATE,
            )?,
            rtc_min_port,
            rtc_max_port,
            announced_address: vars
                .get("MEDIA_ANNOUNCED_ADDRESS")
                .filter(|s| !s.trim().is_empty())
                .cloned(),
            worker_death_exit_delay: Duration::from_millis(parse_var(
                vars,
                "WORKER_DEATH_EXIT_DELAY_MS",
                DEFAULT_WORKER_DEATH_EXIT_DELAY_MS,
            )?),
        };

        // Signaling
        let keepalive_interval = parse_var(
            vars,
            "WS_KEEPALIVE_INTERVAL_SECONDS",
            DEFAULT_WS_KEEPALIVE_INTERVAL_SECONDS,
        )?;
        let keepalive_timeout = parse_var(
            vars,
            "WS_KEEPALIVE_TIMEOUT_SECONDS",
            DEFAULT_WS_KEEPALIVE_TIMEOUT_SECONDS,
        )?;
        if keepalive_interval == 0 || keepalive_timeout <= keepalive_interval {
            return Err(ConfigError::InvalidValue(
                "WS_KEEPALIVE_TIMEOUT_SECONDS must exceed a non-zero WS_KEEPALIVE_INTERVAL_SECONDS"
                    .to_string(),
            ));
        }
        let signaling = SignalingConfig {
            keepalive_interval: Duration::from_secs(keepalive_interval),
            keepalive_timeout: Duration::from_secs(keepalive_timeout),
            chat_max_length: parse_var(vars, "CHAT_MAX_LENGTH", DEFAULT_CHAT_MAX_LENGTH)?,
            key_material_max_bytes: parse_var(
                vars,
                "KEY_MATERIAL_MAX_BYTES",
                DEFAULT_KEY_MATERIAL_MAX_BYTES,
            )?,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        };

        // Housekeeping
        let interval = parse_var(
            vars,
            "HOUSEKEEPING_INTERVAL_SECONDS",
            DEFAULT_HOUSEKEEPING_INTERVAL_SECONDS,
        )?;
        if interval == 0 {
            return Err(ConfigError::InvalidValue(
                "HOUSEKEEPING_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }
        let room_max_duration = parse_var(
            vars,
            "ROOM_MAX_DURATION_SECONDS",
            DEFAULT_ROOM_MAX_DURATION_SECONDS,
        )?;
        let housekeeping = HousekeepingConfig {
            interval: Duration::from_secs(interval),
            pending_peer_timeout: Duration::from_secs(parse_var(
                vars,
                "PENDING_PEER_TIMEOUT_SECONDS",
                DEFAULT_PENDING_PEER_TIMEOUT_SECONDS,
            )?),
            room_max_duration: (room_max_duration > 0)
                .then(|| Duration::from_secs(room_max_duration)),
        };

        Ok(Config {
            bind_address,
            cors_origin,
            jwt_secret,
            session_token_ttl_seconds,
            password_hash_cost,
            capacity,
            tiers,
            media,
            signaling,
            housekeeping,
        })
    }
}
