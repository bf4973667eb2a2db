use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Project logo used when neither the record nor its category carries one
const DEFAULT_LOGO: &str = "https://raw.githubusercontent.com/Sebastian2048/Berluca/main/berluca.png";

/// Upper limit for MAX_SHARDS and SHARD_SEARCH_MARGIN; every pass probes
/// each index up to their sum
pub const MAX_SHARD_INDEX: usize = 10_000;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Layout
    pub output_dir: PathBuf,
    pub shard_base_name: String,

    // Capacity
    pub category_cap: usize,
    pub global_cap: usize,
    pub max_shards: usize,
    pub shard_search_margin: usize,

    // Policies
    pub strict_liveness_gate: bool,
    pub max_urls_per_name: Option<usize>,

    // Artifacts
    pub audit_summary_path: PathBuf,
    pub guide_path: PathBuf,
    pub category_registry_path: Option<PathBuf>,
    pub metrics_textfile: Option<PathBuf>,

    // Misc
    pub default_logo: String,
}

/// Capacity limits handed to the packer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceLimits {
    pub category_cap: usize,
    pub global_cap: usize,
    pub max_shards: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("{0} must not exceed {max}", max = MAX_SHARD_INDEX)]
    LimitTooLarge(&'static str),
    #[error("SHARD_BASE_NAME must not be empty or contain path separators")]
    InvalidBaseName,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let output_dir = PathBuf::from(
            env::var("OUTPUT_DIR").unwrap_or_else(|_| "Berluca".to_string()),
        );

        Self {
            shard_base_name: env::var("SHARD_BASE_NAME")
                .unwrap_or_else(|_| "RP_Servidor".to_string()),

            category_cap: env::var("CATEGORY_CAP")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            global_cap: env::var("GLOBAL_CAP")
                .unwrap_or_else(|_| "800".to_string())
                .parse()
                .unwrap_or(800),
            max_shards: env::var("MAX_SHARDS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            shard_search_margin: env::var("SHARD_SEARCH_MARGIN")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),

            strict_liveness_gate: env::var("STRICT_LIVENESS_GATE")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            max_urls_per_name: env::var("MAX_URLS_PER_NAME")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0),

            audit_summary_path: env::var("AUDIT_SUMMARY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| output_dir.join("RP_Resumen_Auditoria.m3u")),
            guide_path: env::var("GUIDE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| output_dir.join("GUIA_CONTENIDO.md")),
            category_registry_path: env::var("CATEGORY_REGISTRY_PATH").ok().map(PathBuf::from),
            metrics_textfile: env::var("METRICS_TEXTFILE").ok().map(PathBuf::from),

            default_logo: env::var("DEFAULT_LOGO").unwrap_or_else(|_| DEFAULT_LOGO.to_string()),

            output_dir,
        }
    }

    /// Reject settings that would make placement impossible
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.category_cap == 0 {
            return Err(ConfigError::ZeroLimit("CATEGORY_CAP"));
        }
        if self.global_cap == 0 {
            return Err(ConfigError::ZeroLimit("GLOBAL_CAP"));
        }
        if self.max_shards == 0 {
            return Err(ConfigError::ZeroLimit("MAX_SHARDS"));
        }
        if self.max_shards > MAX_SHARD_INDEX {
            return Err(ConfigError::LimitTooLarge("MAX_SHARDS"));
        }
        if self.shard_search_margin > MAX_SHARD_INDEX {
            return Err(ConfigError::LimitTooLarge("SHARD_SEARCH_MARGIN"));
        }
        if self.shard_base_name.trim().is_empty()
            || self.shard_base_name.contains(['/', '\\'])
        {
            return Err(ConfigError::InvalidBaseName);
        }
        Ok(())
    }

    pub fn limits(&self) -> BalanceLimits {
        BalanceLimits {
            category_cap: self.category_cap,
            global_cap: self.global_cap,
            max_shards: self.max_shards,
        }
    }

    /// Highest shard index scanned when collecting or pruning
    pub fn search_bound(&self) -> usize {
        self.max_shards.saturating_add(self.shard_search_margin)
    }

    /// Configuration rooted at `output_dir` with default limits
    #[cfg(test)]
    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            shard_base_name: "RP_Servidor".to_string(),
            category_cap: 30,
            global_cap: 800,
            max_shards: 20,
            shard_search_margin: 100,
            strict_liveness_gate: false,
            max_urls_per_name: None,
            audit_summary_path: output_dir.join("RP_Resumen_Auditoria.m3u"),
            guide_path: output_dir.join("GUIA_CONTENIDO.md"),
            category_registry_path: None,
            metrics_textfile: None,
            default_logo: DEFAULT_LOGO.to_string(),
            output_dir,
        }
    }
}
