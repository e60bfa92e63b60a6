use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub mod resolver;
pub mod scoped;

pub use resolver::ConfigResolver;
pub use scoped::ScopedConfig;

/// Process-level settings. Everything tunable per corpus lives in
/// [`ScopedConfig`]; this struct only carries what is needed to boot.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    #[serde(default = "default_surreal_user")]
    pub surrealdb_username: String,
    #[serde(default = "default_surreal_user")]
    pub surrealdb_password: String,
    #[serde(default = "default_namespace")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_database")]
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// End-to-end budget for a single retrieval request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Reserve subtracted from the request budget before handing deadlines
    /// to individual legs (planner + fusion time).
    #[serde(default = "default_leg_safety_margin_ms")]
    pub leg_safety_margin_ms: u64,
    #[serde(default)]
    pub reranking_enabled: bool,
    pub reranking_pool_size: Option<usize>,
    pub fastembed_cache_dir: Option<String>,
}

fn default_surreal_user() -> String {
    "root".to_string()
}

fn default_namespace() -> String {
    "tribrid".to_string()
}

fn default_database() -> String {
    "tribrid".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_http_port() -> u16 {
    8788
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_leg_safety_margin_ms() -> u64 {
    500
}

/// Load `.env` into the process environment. Pre-existing variables win, so
/// an operator export always beats the checked-in dotenv file.
pub fn apply_dotenv() {
    dotenvy::dotenv().ok();
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

/// Presence booleans for provider credentials. Values are never exposed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SecretsStatus {
    pub openai_api_key: bool,
    pub openrouter_api_key: bool,
    pub cohere_api_key: bool,
}

pub fn secrets_status() -> SecretsStatus {
    fn present(key: &str) -> bool {
        std::env::var(key).map(|v| !v.trim().is_empty()).unwrap_or(false)
    }

    SecretsStatus {
        openai_api_key: present("OPENAI_API_KEY"),
        openrouter_api_key: present("OPENROUTER_API_KEY"),
        cohere_api_key: present("COHERE_API_KEY"),
    }
}
