use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Task board realtime server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "taskboard-server", version, about = "Task board realtime server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "TASKBOARD_PORT", default_value = "5000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "TASKBOARD_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./taskboard.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "TASKBOARD_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for the SQLite database
    #[arg(long, env = "TASKBOARD_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Seconds a call may ring before the caller gets a no-answer hangup
    #[arg(long, env = "TASKBOARD_RING_TIMEOUT_SECS", default_value = "30")]
    pub ring_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            bind_address: "0.0.0.0".to_string(),
            config: "./taskboard.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            ring_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (TASKBOARD_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("TASKBOARD_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Task Board Server Configuration
# Place this file at ./taskboard.toml or specify with --config <path>
# All settings can be overridden via environment variables (TASKBOARD_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 5000)
# port = 5000

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database
# data_dir = "./data"

# Seconds a call may ring before the caller gets a no-answer hangup (default: 30)
# ring_timeout_secs = 30
"#
    .to_string()
}
