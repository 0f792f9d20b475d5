use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote", "ollama" or "anthropic"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub request_timeout_seconds: u64,
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    pub backend: String, // "memory" or "redis"
    pub redis_url: Option<String>,
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Limits applied to every AI-originated query and to the response payload.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryConfig {
    pub timeout_seconds: u64,
    pub max_rows: usize,
    pub preview_rows: usize,
    pub history_turns: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BudgetConfig {
    pub enabled: bool,
    pub default_plan: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub budget: BudgetConfig,
    pub data_dir: String,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory for data storage (ingested files, application database)
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        // Defaults first, so a partial file only overrides what it names
        let mut config_builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/datamind/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // DATAMIND__LLM__API_KEY=... style overrides
        config_builder = config_builder.add_source(
            Environment::with_prefix("DATAMIND")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Command line args win over everything else
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                connection_string: "datamind.duckdb".to_string(),
                pool_size: 5,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                cors_origins: vec!["http://localhost:3000".to_string()],
            },
            llm: LlmConfig {
                backend: "anthropic".to_string(),
                model: "claude-sonnet-4-20250514".to_string(),
                api_key: None,
                api_url: None,
                request_timeout_seconds: 120,
                temperature: 0.1,
            },
            cache: CacheConfig {
                backend: "memory".to_string(),
                redis_url: None,
                ttl_seconds: 300,
                max_entries: 1000,
            },
            query: QueryConfig {
                timeout_seconds: 30,
                max_rows: 10_000,
                preview_rows: 100,
                history_turns: 10,
            },
            budget: BudgetConfig {
                enabled: true,
                default_plan: "free".to_string(),
            },
            data_dir: "data".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_limits() {
        let config = AppConfig::default();
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.query.max_rows, 10_000);
        assert_eq!(config.query.preview_rows, 100);
        assert_eq!(config.query.timeout_seconds, 30);
    }

    #[test]
    fn cli_overrides_apply_without_config_file() {
        let args = CliArgs {
            config: None,
            host: Some("0.0.0.0".to_string()),
            port: Some(8080),
            data_dir: Some("/tmp/datamind".to_string()),
            log_json: false,
        };
        let config = AppConfig::new(&args).unwrap();
        assert_eq!(config.web.host, "0.0.0.0");
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.data_dir, "/tmp/datamind");
        assert_eq!(config.llm.backend, "anthropic");
    }
}
