use clap::Parser;
use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Validation strictness profile. Always an explicit configuration value
/// passed into the validator and pipeline at construction time, never
/// ambient mode state.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Basic syntax checking only.
    Permissive,
    /// All security checks run and are surfaced, but nothing is blocked.
    Demonstrative,
    /// Full checks; unsafe or invalid SQL never reaches the database.
    Strict,
}

impl Phase {
    pub fn parse(s: &str) -> Option<Phase> {
        match s.to_lowercase().as_str() {
            "permissive" => Some(Phase::Permissive),
            "demonstrative" => Some(Phase::Demonstrative),
            "strict" => Some(Phase::Strict),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Permissive => write!(f, "permissive"),
            Phase::Demonstrative => write!(f, "demonstrative"),
            Phase::Strict => write!(f, "strict"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,   // Model name
    pub api_key: Option<String>,
    pub api_url: Option<String>,
}

/// Resource limits applied around generation and execution.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Statement timeout in seconds, applied in strict phase only.
    pub statement_timeout_secs: u64,
    /// Hard cap on returned rows; excess rows are truncated.
    pub max_result_rows: usize,
    /// Upper bound on rendered schema context size in characters.
    pub max_schema_chars: usize,
    /// Cache entry lifetime in seconds.
    pub cache_ttl_secs: u64,
    /// Maximum refinement chain depth. None leaves chains unbounded.
    pub max_refinement_depth: Option<u32>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            statement_timeout_secs: 30,
            max_result_rows: 10_000,
            max_schema_chars: 50_000,
            cache_ttl_secs: crate::cache::store::CACHE_TTL_SECONDS,
            max_refinement_depth: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    #[serde(default = "default_phase")]
    pub phase: Phase,
    #[serde(default)]
    pub limits: LimitsConfig,
    pub data_dir: String,
}

fn default_phase() -> Phase {
    Phase::Strict
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

    /// Directory for tenant data storage
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Validation phase: permissive, demonstrative or strict
    #[arg(long)]
    pub phase: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        // Start with default configuration
        let mut config_builder = Config::builder();

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-query/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // Build the config
        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(phase) = &args.phase {
            config.phase = Phase::parse(phase).ok_or_else(|| {
                ConfigError::Message(format!(
                    "Unknown phase: {} (expected permissive, demonstrative or strict)",
                    phase
                ))
            })?;
        }

        Ok(config)
    }
}

// Default implementation
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                connection_string: "nl-query.db".to_string(),
                pool_size: 5,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            llm: LlmConfig {
                backend: "remote".to_string(),
                model: "sqlcoder".to_string(),
                api_key: None,
                api_url: None,
            },
            phase: Phase::Strict,
            limits: LimitsConfig::default(),
            data_dir: "data".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parse_is_case_insensitive() {
        assert_eq!(Phase::parse("Strict"), Some(Phase::Strict));
        assert_eq!(Phase::parse("DEMONSTRATIVE"), Some(Phase::Demonstrative));
        assert_eq!(Phase::parse("permissive"), Some(Phase::Permissive));
        assert_eq!(Phase::parse("production"), None);
    }

    #[test]
    fn limits_default_to_original_constants() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.cache_ttl_secs, 604_800);
        assert_eq!(limits.max_result_rows, 10_000);
        assert_eq!(limits.max_schema_chars, 50_000);
        assert_eq!(limits.statement_timeout_secs, 30);
        assert!(limits.max_refinement_depth.is_none());
    }
}
