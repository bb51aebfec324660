// src/cli.rs

use clap::Parser;

use crate::config::Settings;

#[derive(Parser, Debug)]
#[command(
    name = "openrouter-gateway",
    version,
    about = "Credential-pooling reverse proxy for the OpenRouter chat-completion API"
)]
pub struct Cli {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Database URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Log level filter
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Applies command-line overrides on top of environment configuration.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(url) = &self.database_url {
            settings.database_url = url.clone();
        }
    }
}
