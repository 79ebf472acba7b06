//! Gateway configuration.

use crate::connection::ConnectionSettings;
use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use zonecast_core::Principal;
use zonecast_events::{RateLimitSettings, RouterSettings, SubscriptionLimits};

/// Main gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener settings.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Per-connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Subscription quotas and lifetimes.
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,

    /// Rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Event router tuning.
    #[serde(default)]
    pub router: RouterConfig,

    /// Background maintenance.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Accounts seeded into the principal store at startup.
    #[serde(default)]
    pub principals: Vec<PrincipalSeed>,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address to bind the `WebSocket` listener to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Maximum simultaneous connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long a new socket may take to authenticate, in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl ListenerConfig {
    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_connections: default_max_connections(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Hex-encoded Ed25519 verifying key. When unset, token signatures are
    /// not checked (expiry still is).
    pub verifying_key: Option<String>,

    /// Accept principals from verified token claims when the store has no
    /// matching account.
    #[serde(default)]
    pub claims_fallback: bool,

    /// Failed attempts from one address before lockout.
    #[serde(default = "default_lockout_threshold")]
    pub lockout_threshold: u32,

    /// Lockout window in seconds.
    #[serde(default = "default_lockout_window")]
    pub lockout_window_secs: u64,

    /// Session lifetime in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Sessions this close to expiry are refreshed by the health monitor,
    /// in seconds.
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            verifying_key: None,
            claims_fallback: false,
            lockout_threshold: default_lockout_threshold(),
            lockout_window_secs: default_lockout_window(),
            session_ttl_secs: default_session_ttl(),
            refresh_margin_secs: default_refresh_margin(),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Bounded send queue capacity per connection.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Direct-send attempts when the queue is full.
    #[serde(default = "default_direct_send_retries")]
    pub direct_send_retries: u32,

    /// Base delay between direct-send attempts, in milliseconds.
    #[serde(default = "default_direct_send_base_delay_ms")]
    pub direct_send_base_delay_ms: u64,

    /// Health monitor tick interval in seconds.
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// How long to wait for a pong after a ping, in seconds.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// A connection whose last ping is older than this is unhealthy, in seconds.
    #[serde(default = "default_ping_staleness")]
    pub ping_staleness_secs: u64,

    /// A connection whose last pong is older than this is unhealthy, in seconds.
    #[serde(default = "default_pong_staleness")]
    pub pong_staleness_secs: u64,

    /// Consecutive errors before the connection enters the error state.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Errors per minute a healthy connection may accumulate.
    #[serde(default = "default_error_rate")]
    pub error_rate_per_minute: u32,

    /// Queue fill percentage above which the connection is unhealthy.
    #[serde(default = "default_queue_pressure")]
    pub queue_pressure_percent: u8,

    /// Recovery attempts before giving up on an errored connection.
    #[serde(default = "default_recovery_attempts")]
    pub recovery_attempts: u32,

    /// Base recovery backoff delay in milliseconds.
    #[serde(default = "default_recovery_base_delay_ms")]
    pub recovery_base_delay_ms: u64,

    /// Recovery backoff cap in milliseconds.
    #[serde(default = "default_recovery_max_delay_ms")]
    pub recovery_max_delay_ms: u64,

    /// Bounded wait for connection tasks to finish on close, in seconds.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,
}

impl ConnectionConfig {
    /// Convert to runtime [`ConnectionSettings`].
    #[must_use]
    pub fn to_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            send_queue_capacity: self.send_queue_capacity,
            direct_send_retries: self.direct_send_retries,
            direct_send_base_delay: Duration::from_millis(self.direct_send_base_delay_ms),
            health_interval: Duration::from_secs(self.health_interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            ping_staleness: Duration::from_secs(self.ping_staleness_secs),
            pong_staleness: Duration::from_secs(self.pong_staleness_secs),
            max_consecutive_errors: self.max_consecutive_errors,
            error_rate_per_minute: self.error_rate_per_minute,
            queue_pressure_percent: self.queue_pressure_percent,
            recovery_attempts: self.recovery_attempts,
            recovery_base_delay: Duration::from_millis(self.recovery_base_delay_ms),
            recovery_max_delay: Duration::from_millis(self.recovery_max_delay_ms),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
            direct_send_retries: default_direct_send_retries(),
            direct_send_base_delay_ms: default_direct_send_base_delay_ms(),
            health_interval_secs: default_health_interval(),
            ping_timeout_secs: default_ping_timeout(),
            ping_staleness_secs: default_ping_staleness(),
            pong_staleness_secs: default_pong_staleness(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_rate_per_minute: default_error_rate(),
            queue_pressure_percent: default_queue_pressure(),
            recovery_attempts: default_recovery_attempts(),
            recovery_base_delay_ms: default_recovery_base_delay_ms(),
            recovery_max_delay_ms: default_recovery_max_delay_ms(),
            close_timeout_secs: default_close_timeout(),
        }
    }
}

/// Subscription quotas and lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Dynamic event-type quota for operators.
    #[serde(default = "default_operator_type_limit")]
    pub operator_type_limit: u32,

    /// Dynamic event-type quota for administrators.
    #[serde(default = "default_admin_type_limit")]
    pub admin_type_limit: u32,

    /// Category quota for operators.
    #[serde(default = "default_operator_category_limit")]
    pub operator_category_limit: u32,

    /// Category quota for administrators.
    #[serde(default = "default_admin_category_limit")]
    pub admin_category_limit: u32,

    /// Subscription lifetime for operators, in hours.
    #[serde(default = "default_operator_ttl_hours")]
    pub operator_ttl_hours: u32,

    /// Subscription lifetime for administrators, in hours.
    #[serde(default = "default_admin_ttl_hours")]
    pub admin_ttl_hours: u32,
}

impl SubscriptionConfig {
    /// Convert to runtime [`SubscriptionLimits`].
    #[must_use]
    pub fn to_limits(&self) -> SubscriptionLimits {
        SubscriptionLimits {
            max_types: self.operator_type_limit,
            max_types_admin: self.admin_type_limit,
            max_categories: self.operator_category_limit,
            max_categories_admin: self.admin_category_limit,
            ttl: chrono::Duration::hours(i64::from(self.operator_ttl_hours)),
            ttl_admin: chrono::Duration::hours(i64::from(self.admin_ttl_hours)),
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            operator_type_limit: default_operator_type_limit(),
            admin_type_limit: default_admin_type_limit(),
            operator_category_limit: default_operator_category_limit(),
            admin_category_limit: default_admin_category_limit(),
            operator_ttl_hours: default_operator_ttl_hours(),
            admin_ttl_hours: default_admin_ttl_hours(),
        }
    }
}

/// Rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in seconds.
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,

    /// Per-window limit for event types without a specific limit.
    #[serde(default = "default_rate_limit")]
    pub default_limit: u32,

    /// Limit multiplier for administrators.
    #[serde(default = "default_admin_multiplier")]
    pub admin_multiplier: u32,

    /// Minimum block duration after a limit is crossed, in seconds.
    #[serde(default = "default_min_block")]
    pub min_block_secs: u64,

    /// Idle windows older than this are evicted, in seconds.
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,
}

impl RateLimitConfig {
    /// Convert to runtime [`RateLimitSettings`].
    #[must_use]
    pub fn to_settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            window: chrono::Duration::seconds(to_i64(self.window_secs)),
            default_limit: self.default_limit,
            admin_multiplier: self.admin_multiplier,
            min_block: chrono::Duration::seconds(to_i64(self.min_block_secs)),
            idle_eviction: chrono::Duration::seconds(to_i64(self.idle_eviction_secs)),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window(),
            default_limit: default_rate_limit(),
            admin_multiplier: default_admin_multiplier(),
            min_block_secs: default_min_block(),
            idle_eviction_secs: default_idle_eviction(),
        }
    }
}

/// Event router tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Deferred queue capacity.
    #[serde(default = "default_deferred_capacity")]
    pub deferred_capacity: usize,

    /// Connected-principal count above which low-priority events defer.
    #[serde(default = "default_load_shed_threshold")]
    pub load_shed_threshold: usize,

    /// Deferred drain interval in seconds.
    #[serde(default = "default_deferred_interval")]
    pub deferred_interval_secs: u64,
}

impl RouterConfig {
    /// Convert to runtime [`RouterSettings`].
    #[must_use]
    pub fn to_settings(&self) -> RouterSettings {
        RouterSettings {
            deferred_capacity: self.deferred_capacity,
            load_shed_threshold: self.load_shed_threshold,
            deferred_interval: Duration::from_secs(self.deferred_interval_secs),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            deferred_capacity: default_deferred_capacity(),
            load_shed_threshold: default_load_shed_threshold(),
            deferred_interval_secs: default_deferred_interval(),
        }
    }
}

/// Background maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval between expiry/idle sweeps, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl MaintenanceConfig {
    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// One account seeded into the principal store at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalSeed {
    /// Account name.
    pub username: String,

    /// Administrator flag.
    #[serde(default)]
    pub admin: bool,

    /// Active flag.
    #[serde(default = "default_true")]
    pub active: bool,
}

impl PrincipalSeed {
    /// Build the principal this seed describes.
    #[must_use]
    pub fn to_principal(&self) -> Principal {
        let mut principal = Principal::new(&self.username);
        if self.admin {
            principal = principal.with_admin();
        }
        if !self.active {
            principal = principal.deactivated();
        }
        principal
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    /// (`<config dir>/zonecast/gateway.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined or the
    /// file cannot be parsed.
    pub fn load_default() -> GatewayResult<Self> {
        let dirs = directories::ProjectDirs::from("io", "zonecast", "zonecast")
            .ok_or_else(|| GatewayError::Config("could not determine config directory".into()))?;

        let config_path = dirs.config_dir().join("gateway.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
fn to_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

// Default value functions
fn default_bind_addr() -> String {
    "127.0.0.1:7343".into()
}

fn default_max_connections() -> usize {
    500
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_lockout_threshold() -> u32 {
    5
}

fn default_lockout_window() -> u64 {
    900
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_refresh_margin() -> u64 {
    300
}

fn default_send_queue_capacity() -> usize {
    100
}

fn default_direct_send_retries() -> u32 {
    3
}

fn default_direct_send_base_delay_ms() -> u64 {
    100
}

fn default_health_interval() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_ping_staleness() -> u64 {
    120
}

fn default_pong_staleness() -> u64 {
    180
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_error_rate() -> u32 {
    5
}

fn default_queue_pressure() -> u8 {
    90
}

fn default_recovery_attempts() -> u32 {
    5
}

fn default_recovery_base_delay_ms() -> u64 {
    1000
}

fn default_recovery_max_delay_ms() -> u64 {
    30_000
}

fn default_close_timeout() -> u64 {
    5
}

fn default_operator_type_limit() -> u32 {
    50
}

fn default_admin_type_limit() -> u32 {
    200
}

fn default_operator_category_limit() -> u32 {
    20
}

fn default_admin_category_limit() -> u32 {
    100
}

fn default_operator_ttl_hours() -> u32 {
    24
}

fn default_admin_ttl_hours() -> u32 {
    168
}

fn default_rate_window() -> u64 {
    60
}

fn default_rate_limit() -> u32 {
    30
}

fn default_admin_multiplier() -> u32 {
    5
}

fn default_min_block() -> u64 {
    60
}

fn default_idle_eviction() -> u64 {
    3600
}

fn default_deferred_capacity() -> usize {
    1000
}

fn default_load_shed_threshold() -> usize {
    100
}

fn default_deferred_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_matches_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.listener.bind_addr, "127.0.0.1:7343");
        assert_eq!(config.listener.max_connections, 500);
        assert_eq!(config.listener.handshake_timeout_secs, 10);
        assert_eq!(config.auth.lockout_threshold, 5);
        assert_eq!(config.auth.session_ttl_secs, 3600);
        assert_eq!(config.connection.send_queue_capacity, 100);
        assert_eq!(config.connection.max_consecutive_errors, 5);
        assert_eq!(config.rate_limit.admin_multiplier, 5);
        assert_eq!(config.router.deferred_capacity, 1000);
        assert!(config.principals.is_empty());
        assert!(!config.auth.claims_fallback);
    }

    #[test]
    fn parse_config_with_principals() {
        let toml = r#"
            [listener]
            bind_addr = "0.0.0.0:9000"
            max_connections = 50

            [auth]
            claims_fallback = true
            session_ttl_secs = 600

            [connection]
            send_queue_capacity = 10

            [[principals]]
            username = "root"
            admin = true

            [[principals]]
            username = "watcher"
        "#;

        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.listener.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.listener.max_connections, 50);
        assert!(config.auth.claims_fallback);
        assert_eq!(config.auth.session_ttl_secs, 600);
        assert_eq!(config.connection.send_queue_capacity, 10);
        // Unset sections keep their defaults.
        assert_eq!(config.rate_limit.window_secs, 60);

        assert_eq!(config.principals.len(), 2);
        let root = config.principals[0].to_principal();
        assert!(root.admin);
        assert!(root.active);
        let watcher = config.principals[1].to_principal();
        assert!(!watcher.admin);
    }

    #[test]
    fn settings_conversions_carry_values() {
        let config = GatewayConfig::default();

        let conn = config.connection.to_settings();
        assert_eq!(conn.send_queue_capacity, 100);
        assert_eq!(conn.health_interval, Duration::from_secs(30));
        assert_eq!(conn.recovery_max_delay, Duration::from_millis(30_000));

        let limits = config.subscriptions.to_limits();
        assert_eq!(limits.max_types, 50);
        assert_eq!(limits.ttl_admin, chrono::Duration::hours(168));

        let rate = config.rate_limit.to_settings();
        assert_eq!(rate.window, chrono::Duration::seconds(60));

        let router = config.router.to_settings();
        assert_eq!(router.load_shed_threshold, 100);
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[listener]\nbind_addr = \"127.0.0.1:0\"").unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.listener.bind_addr, "127.0.0.1:0");
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [").unwrap();

        assert!(GatewayConfig::load(file.path()).is_err());
    }
}
