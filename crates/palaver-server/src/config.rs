use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/palaver.db?mode=rwc".into(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            jwt_expiry_seconds: default_jwt_expiry(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Caches are accelerators only; disabling them leaves every code path
    /// serving straight from the database.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
    #[serde(default = "default_sidebar_ttl")]
    pub sidebar_ttl_secs: u64,
    #[serde(default = "default_unread_ttl")]
    pub unread_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            sidebar_ttl_secs: default_sidebar_ttl(),
            unread_ttl_secs: default_unread_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_presence_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
            sweep_interval_secs: default_presence_sweep_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Worker id baked into generated snowflake ids. Give each server
    /// instance its own value when running more than one.
    #[serde(default = "default_worker_id")]
    pub worker_id: u16,
    #[serde(default = "default_pending_queue_capacity")]
    pub pending_queue_capacity: usize,
    /// Mark-read triggers from the same user and conversation inside this
    /// window are coalesced into one.
    #[serde(default = "default_mark_read_window")]
    pub mark_read_window_secs: u64,
    #[serde(default = "default_max_messages_per_minute")]
    pub max_messages_per_minute: u32,
    #[serde(default = "default_max_typing_events_per_minute")]
    pub max_typing_events_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            pending_queue_capacity: default_pending_queue_capacity(),
            mark_read_window_secs: default_mark_read_window(),
            max_messages_per_minute: default_max_messages_per_minute(),
            max_typing_events_per_minute: default_max_typing_events_per_minute(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_max_connections() -> u32 {
    20
}
fn default_jwt_expiry() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}
fn default_cache_max_entries() -> u64 {
    20_000
}
fn default_sidebar_ttl() -> u64 {
    300
}
fn default_unread_ttl() -> u64 {
    300
}
fn default_presence_ttl() -> u64 {
    60
}
fn default_presence_sweep_interval() -> u64 {
    30
}
fn default_worker_id() -> u16 {
    1
}
fn default_pending_queue_capacity() -> usize {
    10
}
fn default_mark_read_window() -> u64 {
    2
}
fn default_max_messages_per_minute() -> u32 {
    240
}
fn default_max_typing_events_per_minute() -> u32 {
    120
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
        || normalized == "secret"
}

fn validate_secret_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Palaver Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[database]
url = "{db_url}"
max_connections = {max_connections}

[auth]
jwt_secret = "{jwt_secret}"
jwt_expiry_seconds = {jwt_expiry}

[cache]
# Sidebar snapshots, unread counters and presence records live here.
# Disabling the cache keeps full functionality, served from the database.
enabled = {cache_enabled}
max_entries = {cache_max_entries}
sidebar_ttl_secs = {sidebar_ttl}
unread_ttl_secs = {unread_ttl}

[presence]
# How long an unrefreshed presence record counts as online.
ttl_secs = {presence_ttl}
sweep_interval_secs = {presence_sweep}

[gateway]
# Unique per server instance; baked into generated message ids.
worker_id = {worker_id}
# Reappearance notifications queued per offline user (oldest dropped first).
pending_queue_capacity = {pending_capacity}
# Mark-read triggers inside this window are coalesced.
mark_read_window_secs = {mark_read_window}
max_messages_per_minute = {max_messages}
max_typing_events_per_minute = {max_typing}
"#,
        bind_address = config.server.bind_address,
        db_url = config.database.url,
        max_connections = config.database.max_connections,
        jwt_secret = config.auth.jwt_secret,
        jwt_expiry = config.auth.jwt_expiry_seconds,
        cache_enabled = config.cache.enabled,
        cache_max_entries = config.cache.max_entries,
        sidebar_ttl = config.cache.sidebar_ttl_secs,
        unread_ttl = config.cache.unread_ttl_secs,
        presence_ttl = config.presence.ttl_secs,
        presence_sweep = config.presence.sweep_interval_secs,
        worker_id = config.gateway.worker_id,
        pending_capacity = config.gateway.pending_queue_capacity,
        mark_read_window = config.gateway.mark_read_window_secs,
        max_messages = config.gateway.max_messages_per_minute,
        max_typing = config.gateway.max_typing_events_per_minute,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            let template = generate_config_template(&config);
            fs::write(path, &template)?;
            let _ = harden_secret_file_permissions(path);
            tracing::info!("Generated default config at '{}'", path);
            config
        };
        let _ = harden_secret_file_permissions(path);

        // Environment variable overrides
        if let Ok(value) = std::env::var("PALAVER_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("PALAVER_DATABASE_URL") {
            config.database.url = value;
        }
        if let Ok(value) = std::env::var("PALAVER_DATABASE_MAX_CONNECTIONS") {
            if let Ok(parsed) = value.parse::<u32>() {
                config.database.max_connections = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("PALAVER_JWT_EXPIRY_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.auth.jwt_expiry_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_CACHE_ENABLED") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.cache.enabled = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_PRESENCE_TTL_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.presence.ttl_secs = parsed.max(5);
            }
        }
        if let Ok(value) = std::env::var("PALAVER_WORKER_ID") {
            if let Ok(parsed) = value.parse::<u16>() {
                config.gateway.worker_id = parsed;
            }
        }

        validate_secret_configuration(&config)?;
        Ok(config)
    }

    /// Collapse the file config into the runtime config the engine uses.
    pub fn app_config(&self) -> palaver_core::AppConfig {
        palaver_core::AppConfig {
            jwt_secret: self.auth.jwt_secret.clone(),
            jwt_expiry_seconds: self.auth.jwt_expiry_seconds,
            worker_id: self.gateway.worker_id,
            cache_enabled: self.cache.enabled,
            cache_max_entries: self.cache.max_entries,
            presence_ttl_secs: self.presence.ttl_secs,
            presence_sweep_interval_secs: self.presence.sweep_interval_secs,
            sidebar_ttl_secs: self.cache.sidebar_ttl_secs,
            unread_ttl_secs: self.cache.unread_ttl_secs,
            pending_queue_capacity: self.gateway.pending_queue_capacity,
            mark_read_window_secs: self.gateway.mark_read_window_secs,
            max_messages_per_minute: self.gateway.max_messages_per_minute,
            max_typing_events_per_minute: self.gateway.max_typing_events_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn generated_config_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("palaver-test.toml");
        let path = config_path.to_str().expect("config path utf8");

        let generated = Config::load(path).expect("generate config");
        let reloaded = Config::load(path).expect("reload config");
        assert_eq!(generated.auth.jwt_secret, reloaded.auth.jwt_secret);
        assert_eq!(reloaded.cache.enabled, true);
        assert_eq!(reloaded.gateway.pending_queue_capacity, 10);
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("palaver-bad.toml");
        std::fs::write(
            &config_path,
            r#"
[server]
bind_address = "0.0.0.0:8080"

[database]
url = "sqlite::memory:"

[auth]
jwt_secret = "too-short"
"#,
        )
        .expect("write config");
        let result = Config::load(config_path.to_str().expect("config path utf8"));
        assert!(result.is_err());
    }
}
