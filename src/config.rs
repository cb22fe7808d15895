//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use crate::validate::statement::RowLimitMode;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Railway/Docker
            port: 3000,
        }
    }
}

/// Where the policy YAML documents live on disk.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub guardrails_path: PathBuf,
    pub roles_path: PathBuf,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            guardrails_path: PathBuf::from("config/guardrails.yaml"),
            roles_path: PathBuf::from("config/roles.yaml"),
        }
    }
}

/// Pipeline deadlines and validator mode.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub generation_timeout: Duration,
    pub execution_timeout: Duration,
    pub row_limit_mode: RowLimitMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(30),
            row_limit_mode: RowLimitMode::Rewrite,
        }
    }
}

/// Which audit sink backs the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditBackend {
    #[default]
    Postgres,
    Memory,
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub policy: PolicyConfig,
    pub pipeline: PipelineConfig,
    pub cors: CorsConfig,
    pub audit_backend: AuditBackend,
    /// Warehouse connection string. Required unless the audit backend and
    /// executor are both in-memory stand-ins.
    pub database_url: Option<String>,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: std::env::var("HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let policy = PolicyConfig {
            guardrails_path: std::env::var("GUARDRAILS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PolicyConfig::default().guardrails_path),
            roles_path: std::env::var("ROLES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PolicyConfig::default().roles_path),
        };

        let pipeline = PipelineConfig {
            generation_timeout: env_secs("GENERATION_TIMEOUT_SECS")
                .unwrap_or_else(|| PipelineConfig::default().generation_timeout),
            execution_timeout: env_secs("EXECUTION_TIMEOUT_SECS")
                .unwrap_or_else(|| PipelineConfig::default().execution_timeout),
            row_limit_mode: match std::env::var("STRICT_ROW_LIMIT").as_deref() {
                Ok("1") | Ok("true") => RowLimitMode::Strict,
                _ => RowLimitMode::Rewrite,
            },
        };

        let audit_backend = match std::env::var("AUDIT_SINK").as_deref() {
            Ok("memory") => AuditBackend::Memory,
            Ok("postgres") | Err(_) => AuditBackend::Postgres,
            Ok(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "AUDIT_SINK must be 'postgres' or 'memory', got '{other}'"
                )))
            }
        };

        let database_url = std::env::var("DATABASE_URL").ok();
        if database_url.is_none() && audit_backend == AuditBackend::Postgres {
            return Err(ConfigError::MissingVar("DATABASE_URL".to_string()));
        }

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        Ok(Self {
            server,
            policy,
            pipeline,
            cors,
            audit_backend,
            database_url,
        })
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}
