/// Configuration management for the API server
///
/// This module loads configuration from environment variables and provides
/// a type-safe configuration struct.
///
/// # Environment Variables
///
/// - `API_HOST`: Host to bind to (default: 0.0.0.0)
/// - `API_PORT`: Port to bind to (default: 8080)
/// - `DATABASE_URL`: PostgreSQL connection string (unset: in-memory store)
/// - `DATABASE_MAX_CONNECTIONS`: Pool size (default: 10)
/// - `JWT_SECRET`: Secret for administrator tokens, at least 32 characters (required)
/// - `IDENTITY_PROVIDER_URL`: Admin API of the identity provider (unset: in-memory provider)
/// - `IDENTITY_PROVIDER_SERVICE_KEY`: Service key for the identity provider
/// - `IDENTITY_PROVIDER_TIMEOUT_SECONDS`: Per-call timeout (default: 10)
/// - `PROVISION_WAIT_SECONDS`: How long a provision call waits before answering 202 (default: 25)
/// - `CORS_ORIGINS`: Comma-separated allowed origins (default: *)
/// - `PRODUCTION`: Enables HSTS and requires real backends (default: false)
///
/// # Example
///
/// ```no_run
/// use tablehost_api::config::Config;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.bind_address());
/// # Ok(())
/// # }
/// ```

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// JWT configuration
    pub jwt: JwtConfig,

    /// Identity provider configuration
    pub identity: IdentityConfig,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,

    /// Port to bind to
    pub port: u16,

    /// Allowed CORS origins; `*` allows any
    pub cors_origins: Vec<String>,

    /// Production mode (HSTS, no in-memory fallbacks)
    pub production: bool,

    /// Seconds a provision request waits for the saga before answering 202
    pub provision_wait_seconds: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; `None` runs on the in-memory store
    pub url: Option<String>,

    /// Maximum number of connections in pool
    pub max_connections: u32,
}

/// JWT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Secret key for JWT signing
    ///
    /// IMPORTANT: This must be kept secret and should be at least 32 bytes.
    /// Generate with: `openssl rand -hex 32`
    #[serde(skip_serializing)]
    pub secret: String,
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Admin API base URL; `None` runs on the in-memory provider
    pub url: Option<String>,

    #[serde(skip_serializing)]
    pub service_key: Option<String>,

    pub timeout_seconds: u64,
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing
    /// - Environment variables have invalid values
    /// - Production mode is set without a database or identity provider
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present (for development)
        dotenvy::dotenv().ok();

        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let api_port = env::var("API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()?;

        let production = env::var("PRODUCTION")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let provision_wait_seconds = env::var("PROVISION_WAIT_SECONDS")
            .unwrap_or_else(|_| "25".to_string())
            .parse::<u64>()?;

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        let database_url = optional_var("DATABASE_URL");
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u32>()?;

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?;

        if jwt_secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 characters long");
        }

        let identity_url = optional_var("IDENTITY_PROVIDER_URL");
        let service_key = optional_var("IDENTITY_PROVIDER_SERVICE_KEY");
        let timeout_seconds = env::var("IDENTITY_PROVIDER_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()?;

        if identity_url.is_some() && service_key.is_none() {
            anyhow::bail!("IDENTITY_PROVIDER_SERVICE_KEY is required when IDENTITY_PROVIDER_URL is set");
        }

        if production {
            if database_url.is_none() {
                anyhow::bail!("DATABASE_URL is required in production");
            }
            if identity_url.is_none() {
                anyhow::bail!("IDENTITY_PROVIDER_URL is required in production");
            }
        }

        Ok(Self {
            api: ApiConfig {
                host: api_host,
                port: api_port,
                cors_origins,
                production,
                provision_wait_seconds,
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections,
            },
            jwt: JwtConfig { secret: jwt_secret },
            identity: IdentityConfig {
                url: identity_url,
                service_key,
                timeout_seconds,
            },
        })
    }

    /// Returns the server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    /// How long a provision request waits for the saga
    pub fn provision_wait(&self) -> Duration {
        Duration::from_secs(self.api.provision_wait_seconds)
    }

    /// Configuration for tests and local runs: in-memory backends, permissive CORS
    pub fn local(jwt_secret: &str) -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                cors_origins: vec!["*".to_string()],
                production: false,
                provision_wait_seconds: 25,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
            },
            jwt: JwtConfig {
                secret: jwt_secret.to_string(),
            },
            identity: IdentityConfig {
                url: None,
                service_key: None,
                timeout_seconds: 10,
            },
        }
    }
}
