use serde::Deserialize;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{KeyRing, RsaKeys, LEGACY_AES_PASSPHRASE};
use crate::error::CryptoError;
use crate::handler::{ServerInfo, DEFAULT_MAX_IDLE};

/// Configuration for the server.
///
/// Covers the worker pool, the handler pools, the key material of the transform
/// chain and the hyper connection settings for HTTP/1.x and HTTP/2 (when the
/// "http2" feature is enabled). It can be initialized from environment variables
/// with the "SHEATH_" prefix or from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Maximum number of worker threads. Defaults to CPU count * 15.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Keep-alive duration in seconds for worker threads. Defaults to 6 seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub worker_keep_alive_secs: u64,
    /// Server host address. Defaults to "127.0.0.1".
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port number. Defaults to 3000.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Keep connections open between requests. Defaults to true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Recycle handler instances through their pools instead of building one per request.
    #[serde(default)]
    pub use_object_pool: bool,
    /// Idle instances kept per handler type. Defaults to 100.
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
    /// Leading text of the default "not found" body.
    #[serde(default = "default_404_info")]
    pub default_404_info: String,
    /// Shared AES passphrase; 16, 24 or 32 bytes.
    #[serde(default = "default_aes_passphrase")]
    pub aes_passphrase: String,
    /// PEM file holding the RSA private key, PKCS#8 or PKCS#1.
    #[serde(default)]
    pub rsa_private_key_path: Option<String>,
    /// Size of the keypair generated when no PEM file is configured.
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,
    #[serde(default)]
    pub http1_half_close: bool,
    /// Maximum buffer size for HTTP/1.x requests. Defaults to 512kb (524,288 bytes).
    #[serde(default = "default_max_buf_size")]
    pub http1_max_buf_size: usize,
    #[serde(default)]
    pub http1_pipeline_flush: bool,
    #[serde(default = "default_true")]
    pub http1_writev: bool,
    /// Emit `Original-Encrypt` rather than `original-encrypt`. Defaults to true.
    #[serde(default = "default_true")]
    pub http1_title_case_headers: bool,
    #[serde(default)]
    pub http1_preserve_header_case: bool,
    #[serde(default)]
    pub http1_only: bool,
    #[cfg(feature = "http2")]
    #[serde(default)]
    pub http2_only: bool,
    #[cfg(feature = "http2")]
    #[serde(default)]
    pub http2_initial_stream_window_size: Option<u32>,
    #[cfg(feature = "http2")]
    #[serde(default)]
    pub http2_initial_connection_window_size: Option<u32>,
    #[cfg(feature = "http2")]
    #[serde(default = "default_true")]
    pub http2_adaptive_window: bool,
    #[cfg(feature = "http2")]
    #[serde(default)]
    pub http2_max_frame_size: Option<u32>,
    #[cfg(feature = "http2")]
    #[serde(default)]
    pub http2_max_concurrent_streams: Option<u32>,
    #[cfg(feature = "http2")]
    #[serde(default = "default_max_buf_size")]
    pub http2_max_send_buf_size: usize,
}

/// Implements conversion from the config crate's Config type to ServerConfig.
impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "SHEATH_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("SHEATH"));

        builder.build()?.try_into()
    }

    /// Converts the worker_keep_alive_secs value into a Duration.
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    /// "host:port" to bind to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn server_info(&self) -> Arc<ServerInfo> {
        Arc::new(ServerInfo {
            default_404_info: self.default_404_info.clone(),
            port: self.port,
        })
    }

    /// Builds the key material of the transform chain.
    ///
    /// The RSA key comes from `rsa_private_key_path` when set; otherwise a
    /// fresh keypair of `rsa_key_bits` is generated.
    ///
    /// # Errors
    /// Fails when the PEM file cannot be read or parsed, when key generation
    /// fails, or when the AES passphrase has an unusable length.
    pub fn key_ring(&self) -> Result<KeyRing, CryptoError> {
        let passphrase = self.aes_passphrase.as_bytes();
        if !matches!(passphrase.len(), 16 | 24 | 32) {
            return Err(CryptoError::KeyLength(passphrase.len()));
        }

        let rsa = match &self.rsa_private_key_path {
            Some(path) => {
                log::info!("Loading RSA private key from {}", path);
                RsaKeys::from_pem_file(path)?
            }
            None => {
                log::info!("Generating a {}-bit RSA keypair", self.rsa_key_bits);
                RsaKeys::generate(self.rsa_key_bits)?
            }
        };

        if self.aes_passphrase == LEGACY_AES_PASSPHRASE {
            log::warn!("Using the built-in AES passphrase; set SHEATH_AES_PASSPHRASE to override it");
        }
        Ok(KeyRing::new(passphrase, rsa))
    }
}

/// Default value for max_workers. Returns CPU count * 15.
fn default_max_workers() -> usize {
    num_cpus::get() * 15
}

/// Default worker keep-alive duration in seconds.
fn default_keep_alive_secs() -> u64 {
    6
}

/// Default host address.
fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Default port number.
fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_pool_max_idle() -> usize {
    DEFAULT_MAX_IDLE
}

fn default_404_info() -> String {
    "HTTP STATUS 404 Not Found".to_string()
}

fn default_aes_passphrase() -> String {
    LEGACY_AES_PASSPHRASE.to_string()
}

fn default_rsa_key_bits() -> usize {
    1024
}

/// Default maximum buffer size (512kb).
fn default_max_buf_size() -> usize {
    524_288
}

/// Provides default values for all configuration options.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_keep_alive_secs: default_keep_alive_secs(),
            host: default_host(),
            port: default_port(),
            keep_alive: true,
            use_object_pool: false,
            pool_max_idle: DEFAULT_MAX_IDLE,
            default_404_info: default_404_info(),
            aes_passphrase: default_aes_passphrase(),
            rsa_private_key_path: None,
            rsa_key_bits: default_rsa_key_bits(),
            http1_half_close: false,
            http1_max_buf_size: default_max_buf_size(),
            http1_pipeline_flush: false,
            http1_writev: true,
            http1_title_case_headers: true,
            http1_preserve_header_case: false,
            http1_only: false,
            #[cfg(feature = "http2")]
            http2_only: false,
            #[cfg(feature = "http2")]
            http2_initial_stream_window_size: None,
            #[cfg(feature = "http2")]
            http2_initial_connection_window_size: None,
            #[cfg(feature = "http2")]
            http2_adaptive_window: true,
            #[cfg(feature = "http2")]
            http2_max_frame_size: None,
            #[cfg(feature = "http2")]
            http2_max_concurrent_streams: None,
            #[cfg(feature = "http2")]
            http2_max_send_buf_size: default_max_buf_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Tests that the default configuration values are set correctly.
    /// Verifies:
    /// - max_workers is CPU count * 15
    /// - the handler pools are off, bounded at 100 when turned on
    /// - the negotiation headers go out title-cased
    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_workers, num_cpus::get() * 15);
        assert_eq!(config.address(), "127.0.0.1:3000");
        assert!(!config.use_object_pool);
        assert_eq!(config.pool_max_idle, 100);
        assert_eq!(config.default_404_info, "HTTP STATUS 404 Not Found");
        assert!(config.http1_title_case_headers);
        assert!(config.keep_alive);
    }

    /// Tests configuration loading from environment variables.
    /// Verifies that the ServerConfig correctly reads and applies
    /// values from environment variables with the "SHEATH_" prefix.
    #[test]
    fn test_config_from_env() {
        env::set_var("SHEATH_PORT", "9000");
        env::set_var("SHEATH_HOST", "0.0.0.0");
        env::set_var("SHEATH_MAX_WORKERS", "4");
        env::set_var("SHEATH_USE_OBJECT_POOL", "true");

        let config = ServerConfig::new().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_workers, 4);
        assert!(config.use_object_pool);
        assert_eq!(config.pool_max_idle, 100);

        env::remove_var("SHEATH_PORT");
        env::remove_var("SHEATH_HOST");
        env::remove_var("SHEATH_MAX_WORKERS");
        env::remove_var("SHEATH_USE_OBJECT_POOL");
    }

    /// Tests that the key ring rejects passphrases AES cannot use.
    #[test]
    fn test_key_ring_passphrase_length() {
        let config = ServerConfig {
            aes_passphrase: "too short".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.key_ring(), Err(CryptoError::KeyLength(9))));
    }

    #[test]
    fn test_key_ring_missing_pem() {
        let config = ServerConfig {
            rsa_private_key_path: Some("/nonexistent/key.pem".to_string()),
            ..ServerConfig::default()
        };
        assert!(matches!(config.key_ring(), Err(CryptoError::Io(_))));
    }

    #[test]
    fn test_key_ring_generated() {
        let config = ServerConfig {
            rsa_key_bits: 512,
            ..ServerConfig::default()
        };
        let ring = config.key_ring().unwrap();
        assert_eq!(ring.aes_passphrase(), LEGACY_AES_PASSPHRASE.as_bytes());
        assert_eq!(ring.rsa().size(), 64);
    }

    /// Tests HTTP/2 specific default configuration values.
    #[cfg(feature = "http2")]
    #[test]
    fn test_http2_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http2_max_send_buf_size, 524288);
        assert!(!config.http2_only);
    }
}
