//! Configuration loading and constants.
//!
//! Loads the proxy configuration from an optional TOML file, applies command-line
//! overrides and validates the result before any listener is bound. `AppConfig` is
//! the root configuration struct containing all settings.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use const_format::formatcp;
use http::uri::Authority;
use serde::Deserialize;

// =============================================================================
// Lifecycle Constants
// =============================================================================

/// Shared deadline for draining both listeners after a shutdown trigger
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Upper bound for reading a ClientHello and finishing a TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// ACME Constants
// =============================================================================

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION_DIRECTORY: &str =
    "https://acme-v02.api.letsencrypt.org/directory";

/// Renew certificates this many days before they expire
pub const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

/// How often the background renewal task looks at the cached certificate
pub const DEFAULT_RENEWAL_CHECK_HOURS: u64 = 12;

/// Path prefix the certificate authority uses for HTTP-01 validation
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Router pattern for HTTP-01 challenge tokens
pub const ACME_CHALLENGE_ROUTE: &str = formatcp!("{}{{token}}", ACME_CHALLENGE_PREFIX);

/// Lifetime of a published challenge token
pub const ACME_CHALLENGE_TTL_SECS: u64 = 600;

/// Delay between ACME order/authorization polls
pub const ACME_POLL_INTERVAL_SECS: u64 = 2;

/// Maximum number of ACME polls before an order is abandoned
pub const ACME_MAX_POLLS: u32 = 30;

/// File name of the persisted ACME account inside the cache directory
pub const ACME_ACCOUNT_FILE: &str = "acme_account.json";

// =============================================================================
// Proxy Constants
// =============================================================================

/// Timeout for establishing a backend connection
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Timeout for receiving the backend response head (body streaming is unbounded)
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 60;

/// Idle backend connections are dropped from the pool after this long
pub const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 90;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Configuration file read when `--config` is not given and the file exists
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tlsgate.toml";

/// Certificate cache directory
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/tlsgate/certs";

/// Backend used when none is configured
pub const DEFAULT_BACKEND: &str = "127.0.0.1:8080";

/// Default bind address for both listeners
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "tlsgate=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// The single host name this proxy serves and obtains a certificate for
    pub domain: Option<String>,
    /// Plaintext backend as `host:port`
    #[serde(default = "AppConfig::default_backend")]
    pub backend: String,
    /// Listener configuration
    #[serde(default)]
    pub http: HttpServerConfig,
    /// Certificate issuance configuration
    #[serde(default)]
    pub acme: AcmeSettings,
    /// Backend client configuration
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            domain: None,
            backend: Self::default_backend(),
            http: HttpServerConfig::default(),
            acme: AcmeSettings::default(),
            proxy: ProxySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    fn default_backend() -> String {
        DEFAULT_BACKEND.to_string()
    }

    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Check the configuration and return the validated pieces the core needs.
    ///
    /// A missing domain is reported separately from a malformed one since it is
    /// the only setting without a default.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let domain = self
            .domain
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(ConfigError::MissingDomain)?;
        let domain = validate_domain(domain)?;
        let backend = BackendTarget::parse(&self.backend)?;

        if self.http.shutdown_grace_seconds == 0 {
            return Err(ConfigError::Validation(
                "http.shutdown_grace_seconds must be greater than zero".to_string(),
            ));
        }

        Ok(ValidatedConfig { domain, backend })
    }
}

/// Values that only exist once validation succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub domain: String,
    pub backend: BackendTarget,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "HttpServerConfig::default_host")]
    pub host: String,
    /// Plaintext listener (redirects and HTTP-01 challenges)
    #[serde(default = "HttpServerConfig::default_redirect_port")]
    pub redirect_port: u16,
    /// TLS listener (proxied traffic)
    #[serde(default = "HttpServerConfig::default_https_port")]
    pub https_port: u16,
    #[serde(default = "HttpServerConfig::default_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "HttpServerConfig::default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            redirect_port: Self::default_redirect_port(),
            https_port: Self::default_https_port(),
            shutdown_grace_seconds: Self::default_grace(),
            handshake_timeout_seconds: Self::default_handshake_timeout(),
        }
    }
}

impl HttpServerConfig {
    fn default_host() -> String {
        DEFAULT_BIND_HOST.to_string()
    }
    fn default_redirect_port() -> u16 {
        80
    }
    fn default_https_port() -> u16 {
        443
    }
    fn default_grace() -> u64 {
        DEFAULT_SHUTDOWN_GRACE_SECS
    }
    fn default_handshake_timeout() -> u64 {
        DEFAULT_HANDSHAKE_TIMEOUT_SECS
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

/// Certificate issuance settings
#[derive(Debug, Clone, Deserialize)]
pub struct AcmeSettings {
    /// ACME directory of the certificate authority
    #[serde(default = "AcmeSettings::default_directory")]
    pub directory_url: String,
    /// Optional contact address registered with the account
    pub contact_email: Option<String>,
    /// Certificate and account cache
    #[serde(default = "AcmeSettings::default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "AcmeSettings::default_renew_before")]
    pub renew_before_days: i64,
    #[serde(default = "AcmeSettings::default_renewal_check")]
    pub renewal_check_hours: u64,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            directory_url: Self::default_directory(),
            contact_email: None,
            cache_dir: Self::default_cache_dir(),
            renew_before_days: Self::default_renew_before(),
            renewal_check_hours: Self::default_renewal_check(),
        }
    }
}

impl AcmeSettings {
    fn default_directory() -> String {
        LETS_ENCRYPT_PRODUCTION_DIRECTORY.to_string()
    }
    fn default_cache_dir() -> PathBuf {
        PathBuf::from(DEFAULT_CACHE_DIR)
    }
    fn default_renew_before() -> i64 {
        DEFAULT_RENEW_BEFORE_DAYS
    }
    fn default_renewal_check() -> u64 {
        DEFAULT_RENEWAL_CHECK_HOURS
    }

    pub fn renew_before(&self) -> chrono::Duration {
        chrono::Duration::days(self.renew_before_days)
    }

    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_hours.max(1) * 3600)
    }
}

/// Backend client settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "ProxySettings::default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "ProxySettings::default_response_timeout")]
    pub response_timeout_seconds: u64,
    #[serde(default = "ProxySettings::default_pool_idle_timeout")]
    pub pool_idle_timeout_seconds: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: Self::default_connect_timeout(),
            response_timeout_seconds: Self::default_response_timeout(),
            pool_idle_timeout_seconds: Self::default_pool_idle_timeout(),
        }
    }
}

impl ProxySettings {
    fn default_connect_timeout() -> u64 {
        DEFAULT_CONNECT_TIMEOUT_SECS
    }
    fn default_response_timeout() -> u64 {
        DEFAULT_RESPONSE_TIMEOUT_SECS
    }
    fn default_pool_idle_timeout() -> u64 {
        DEFAULT_POOL_IDLE_TIMEOUT_SECS
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// The plaintext backend every proxied request is sent to.
///
/// Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    host: String,
    port: u16,
}

impl BackendTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` pair. The port is mandatory.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::Validation(format!("backend must be host:port, got {value:?}"));

        if value.contains('/') || value.contains('@') {
            return Err(invalid());
        }
        let authority = Authority::from_str(value.trim()).map_err(|_| invalid())?;
        let port = authority.port_u16().ok_or_else(invalid)?;
        let host = authority.host();
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL for plaintext requests to the backend, without a trailing slash
    pub fn base_url(&self) -> String {
        format!("http://{}", self)
    }
}

impl std::fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Normalise and check the served domain.
fn validate_domain(domain: &str) -> Result<String, ConfigError> {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();

    let reject = |reason: &str| {
        Err(ConfigError::Validation(format!(
            "domain {domain:?} is invalid: {reason}"
        )))
    };

    if domain.contains("://") {
        return reject("must not include a scheme");
    }
    if domain.contains('/') {
        return reject("must not include a path");
    }
    if domain.contains(':') {
        return reject("must not include a port");
    }
    if domain.contains('*') {
        return reject("wildcards are not supported");
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return reject("contains characters not allowed in a host name");
    }
    if domain.split('.').any(str::is_empty) {
        return reject("contains an empty label");
    }

    Ok(domain)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("No domain configured. Set `domain` in the config file, --domain or TLSGATE_DOMAIN")]
    MissingDomain,
    #[error("Configuration error: {0}")]
    Validation(String),
}
