use std::path::Path;

use serde::{Deserialize, Serialize};

/// Main configuration structure for pkg-tracker
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub carriers: CarrierCredentials,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub email: EmailConfig,

    #[serde(default)]
    pub llm: LlmConfig,
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path, e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration without a file: defaults plus environment overrides.
    pub fn from_env() -> Result<Self, crate::Error> {
        if let Ok(config_path) = std::env::var("PKG_TRACKER_CONFIG") {
            return Self::load(&config_path);
        }

        let default_paths = [
            "./config/default.toml",
            "./pkg-tracker.toml",
            "/etc/pkg-tracker/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override file values. Nested keys use the
    /// `PKG_TRACKER_` prefix with `_`-joined section names.
    pub fn apply_env_overrides(&mut self) {
        fn env(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = env("PKG_TRACKER_SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env("PKG_TRACKER_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
        if let Some(v) = env("PKG_TRACKER_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Some(v) = env("PKG_TRACKER_CACHE_TTL").and_then(|v| v.parse().ok()) {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = env("PKG_TRACKER_CACHE_DISABLED").and_then(|v| v.parse().ok()) {
            self.cache.disabled = v;
        }
        if let Some(v) = env("PKG_TRACKER_UPDATE_INTERVAL").and_then(|v| v.parse().ok()) {
            self.update.interval_secs = v;
        }
        if let Some(v) = env("PKG_TRACKER_UPDATE_AUTO_ENABLED").and_then(|v| v.parse().ok()) {
            self.update.auto_enabled = v;
        }
        if let Some(v) = env("PKG_TRACKER_UPDATE_FAILURE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.update.failure_threshold = v;
        }
        if let Some(v) = env("PKG_TRACKER_UPDATE_CUTOFF_DAYS").and_then(|v| v.parse().ok()) {
            self.update.cutoff_days = v;
        }
        if let Some(v) = env("PKG_TRACKER_USPS_API_KEY") {
            self.carriers.usps.api_key = v;
        }
        if let Some(v) = env("PKG_TRACKER_UPS_CLIENT_ID") {
            self.carriers.ups.client_id = v;
        }
        if let Some(v) = env("PKG_TRACKER_UPS_CLIENT_SECRET") {
            self.carriers.ups.client_secret = v;
        }
        if let Some(v) = env("PKG_TRACKER_FEDEX_CLIENT_ID") {
            self.carriers.fedex.client_id = v;
        }
        if let Some(v) = env("PKG_TRACKER_FEDEX_CLIENT_SECRET") {
            self.carriers.fedex.client_secret = v;
        }
        if let Some(v) = env("PKG_TRACKER_FEDEX_API_URL") {
            self.carriers.fedex.api_url = v;
        }
        if let Some(v) = env("PKG_TRACKER_DHL_API_KEY") {
            self.carriers.dhl.api_key = v;
        }
        if let Some(v) = env("PKG_TRACKER_ADMIN_API_KEY") {
            self.admin.api_key = v;
        }
        if let Some(v) = env("PKG_TRACKER_ADMIN_AUTH_DISABLED").and_then(|v| v.parse().ok()) {
            self.admin.auth_disabled = v;
        }
        if let Some(v) = env("PKG_TRACKER_EMAIL_CLIENT_ID") {
            self.email.oauth.client_id = v;
        }
        if let Some(v) = env("PKG_TRACKER_EMAIL_CLIENT_SECRET") {
            self.email.oauth.client_secret = v;
        }
        if let Some(v) = env("PKG_TRACKER_EMAIL_REFRESH_TOKEN") {
            self.email.oauth.refresh_token = v;
        }
        if let Some(v) = env("PKG_TRACKER_EMAIL_DRY_RUN").and_then(|v| v.parse().ok()) {
            self.email.dry_run = v;
        }
        if let Some(v) = env("PKG_TRACKER_LLM_ENABLED").and_then(|v| v.parse().ok()) {
            self.llm.enabled = v;
        }
        if let Some(v) = env("PKG_TRACKER_LLM_API_KEY") {
            self.llm.api_key = v;
        }
    }

    /// Validate configuration; failures here are fatal at startup.
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.server.port == 0 {
            return Err(Error::Config("Invalid server port".to_string()));
        }

        if self.database.path.is_empty() {
            return Err(Error::Config("Database path must not be empty".to_string()));
        }

        if self.cache.ttl_secs == 0 && !self.cache.disabled {
            return Err(Error::Config(
                "cache.ttl must be > 0 unless caching is disabled".to_string(),
            ));
        }

        if self.update.failure_threshold == 0 {
            return Err(Error::Config(
                "update.failure_threshold must be > 0".to_string(),
            ));
        }

        if self.update.batch_size == 0 || self.update.batch_size > 10 {
            return Err(Error::Config(
                "update.batch_size must be between 1 and 10".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.email.min_confidence) {
            return Err(Error::Config(
                "email.min_confidence must be within [0, 1]".to_string(),
            ));
        }

        if self.llm.enabled && self.llm.endpoint.is_empty() && self.llm.provider == "local" {
            return Err(Error::Config(
                "llm.endpoint is required for the local provider".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_graceful_shutdown")]
    pub graceful_shutdown_secs: u64,

    /// Directory served for non-/api paths (the SPA bundle)
    #[serde(default = "default_static_dir")]
    pub static_dir: String,

    /// Origins allowed by CORS; empty means permissive (local development)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            graceful_shutdown_secs: default_graceful_shutdown(),
            static_dir: default_static_dir(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_graceful_shutdown() -> u64 {
    30
}

fn default_static_dir() -> String {
    "./web/dist".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Optional separate file for the email entities; same schema shape
    #[serde(default)]
    pub email_path: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            email_path: None,
        }
    }
}

fn default_db_path() -> String {
    "./pkg-tracker.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Refresh-gate TTL; the cooldown uses the same value
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default)]
    pub disabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            disabled: false,
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_update_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_true")]
    pub auto_enabled: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i64,

    #[serde(default = "default_cutoff_days")]
    pub cutoff_days: i64,

    /// USPS batch size; the carrier accepts at most 10 numbers per call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    #[serde(default = "default_individual_timeout")]
    pub individual_timeout_secs: u64,

    #[serde(default)]
    pub ups: CarrierUpdateOverride,

    #[serde(default)]
    pub usps: CarrierUpdateOverride,

    #[serde(default)]
    pub fedex: CarrierUpdateOverride,

    #[serde(default)]
    pub dhl: CarrierUpdateOverride,

    #[serde(default)]
    pub amazon: CarrierUpdateOverride,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_update_interval(),
            auto_enabled: true,
            failure_threshold: default_failure_threshold(),
            cutoff_days: default_cutoff_days(),
            batch_size: default_batch_size(),
            batch_timeout_secs: default_batch_timeout(),
            individual_timeout_secs: default_individual_timeout(),
            ups: CarrierUpdateOverride::default(),
            usps: CarrierUpdateOverride::default(),
            fedex: CarrierUpdateOverride::default(),
            dhl: CarrierUpdateOverride::default(),
            amazon: CarrierUpdateOverride::default(),
        }
    }
}

impl UpdateConfig {
    pub fn override_for(&self, code: crate::models::CarrierCode) -> &CarrierUpdateOverride {
        use crate::models::CarrierCode;
        match code {
            CarrierCode::Ups => &self.ups,
            CarrierCode::Usps => &self.usps,
            CarrierCode::Fedex => &self.fedex,
            CarrierCode::Dhl => &self.dhl,
            CarrierCode::Amazon => &self.amazon,
        }
    }

    /// Effective cutoff for a carrier, honoring the per-carrier override
    pub fn cutoff_days_for(&self, code: crate::models::CarrierCode) -> i64 {
        self.override_for(code).cutoff_days.unwrap_or(self.cutoff_days)
    }

    /// Whether auto-update is enabled for a carrier
    pub fn enabled_for(&self, code: crate::models::CarrierCode) -> bool {
        self.auto_enabled && self.override_for(code).enabled.unwrap_or(true)
    }
}

/// Per-carrier updater overrides; None falls through to the global value
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CarrierUpdateOverride {
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub cutoff_days: Option<i64>,
}

fn default_update_interval() -> u64 {
    3600
}

fn default_failure_threshold() -> i64 {
    10
}

fn default_cutoff_days() -> i64 {
    30
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_timeout() -> u64 {
    60
}

fn default_individual_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CarrierCredentials {
    #[serde(default)]
    pub usps: UspsCredentials,

    #[serde(default)]
    pub ups: OauthCredentials,

    #[serde(default)]
    pub fedex: FedexCredentials,

    #[serde(default)]
    pub dhl: DhlCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UspsCredentials {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OauthCredentials {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FedexCredentials {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default = "default_fedex_api_url")]
    pub api_url: String,
}

impl Default for FedexCredentials {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_url: default_fedex_api_url(),
        }
    }
}

fn default_fedex_api_url() -> String {
    "https://apis.fedex.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DhlCredentials {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    /// Bearer key required on /api/admin routes
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub auth_disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub oauth: MailboxOauth,

    #[serde(default = "default_scan_days")]
    pub scan_days: i64,

    #[serde(default = "default_true")]
    pub body_storage_enabled: bool,

    #[serde(default)]
    pub body_compression_enabled: bool,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default = "default_email_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_max_per_scan")]
    pub max_per_scan: usize,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Loopback URL of this process's own HTTP API
    #[serde(default = "default_email_api_url")]
    pub api_url: String,

    #[serde(default = "default_api_retry_count")]
    pub api_retry_count: u32,

    #[serde(default = "default_api_retry_delay")]
    pub api_retry_delay_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            oauth: MailboxOauth::default(),
            scan_days: default_scan_days(),
            body_storage_enabled: true,
            body_compression_enabled: false,
            retention_days: default_retention_days(),
            check_interval_secs: default_email_check_interval(),
            max_per_scan: default_max_per_scan(),
            dry_run: false,
            min_confidence: default_min_confidence(),
            api_url: default_email_api_url(),
            api_retry_count: default_api_retry_count(),
            api_retry_delay_secs: default_api_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MailboxOauth {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default = "default_mailbox_api_url")]
    pub api_url: String,
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_mailbox_api_url() -> String {
    "https://gmail.googleapis.com/gmail/v1".to_string()
}

fn default_scan_days() -> i64 {
    7
}

fn default_retention_days() -> i64 {
    90
}

fn default_email_check_interval() -> u64 {
    300
}

fn default_max_per_scan() -> usize {
    100
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_email_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_api_retry_count() -> u32 {
    3
}

fn default_api_retry_delay() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,

    /// One of `openai`, `anthropic`, `local`
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_llm_retry_count")]
    pub retry_count: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: String::new(),
            endpoint: String::new(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            timeout_secs: default_llm_timeout(),
            retry_count: default_llm_retry_count(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_max_tokens() -> u32 {
    1024
}

fn default_llm_temperature() -> f64 {
    0.0
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_llm_retry_count() -> u32 {
    2
}
