use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and from
/// environment variables with the prefix `AUDIENCE_MANAGER__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_output_table_prefix")]
    pub output_table_prefix: String,
    #[serde(default = "default_segment_name_prefix")]
    pub segment_name_prefix: String,
}

/// One raw transaction table contributing to the unified transaction view.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TransactionSourceConfig {
    pub table: String,
    pub source_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompilerConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<TransactionSourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_metadata_update_attempts")]
    pub metadata_update_attempts: u32,
    #[serde(default = "default_refresh_stale_dependencies")]
    pub refresh_stale_dependencies: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_output_table_prefix() -> String {
    "segment_output_".to_string()
}
fn default_segment_name_prefix() -> String {
    "segment_".to_string()
}
fn default_sources() -> Vec<TransactionSourceConfig> {
    vec![
        TransactionSourceConfig {
            table: "upi_transactions_raw".to_string(),
            source_type: "UPI".to_string(),
        },
        TransactionSourceConfig {
            table: "credit_card_transactions_raw".to_string(),
            source_type: "CREDIT_CARD".to_string(),
        },
    ]
}
fn default_max_concurrent_runs() -> usize {
    4
}
fn default_retry_delay_secs() -> u64 {
    60
}
fn default_metadata_update_attempts() -> u32 {
    3
}
fn default_refresh_stale_dependencies() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            output_table_prefix: default_output_table_prefix(),
            segment_name_prefix: default_segment_name_prefix(),
        }
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            retry_delay_secs: default_retry_delay_secs(),
            metadata_update_attempts: default_metadata_update_attempts(),
            refresh_stale_dependencies: default_refresh_stale_dependencies(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            catalog: CatalogConfig::default(),
            compiler: CompilerConfig::default(),
            scheduler: SchedulerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl CatalogConfig {
    pub fn table_name(&self, rule_id: crate::types::RuleId) -> String {
        format!("{}{}", self.output_table_prefix, rule_id)
    }

    pub fn segment_name(&self, rule_id: crate::types::RuleId) -> String {
        format!("{}{}", self.segment_name_prefix, rule_id)
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional config file, then environment
    /// variables. Environment values win.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("AUDIENCE_MANAGER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
