//! Command-line interface.

use std::path::PathBuf;

use aegis_domain::config::{Config, ConfigSeverity};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aegis", about = "Security-enforcing gateway & supervisor for AI agents")]
pub struct Cli {
    /// Config file path (default: ./aegis.toml, or AEGIS_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default).
    Serve,
    /// Configuration inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Environment and dependency checks.
    Doctor,
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config and exit non-zero on errors.
    Validate,
    /// Print the effective config as TOML.
    Show,
}

/// Resolve and load the config: flag → AEGIS_CONFIG → ./aegis.toml →
/// defaults + env.
pub fn load_config(flag: Option<&PathBuf>) -> anyhow::Result<(Config, String)> {
    let candidate = flag
        .cloned()
        .or_else(|| std::env::var("AEGIS_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let default = PathBuf::from("aegis.toml");
            default.exists().then_some(default)
        });

    match candidate {
        Some(path) => {
            let config = Config::load(&path)?;
            Ok((config, path.display().to_string()))
        }
        None => Ok((Config::from_env(), "<defaults + env>".to_string())),
    }
}

/// `config validate`: print every issue, return false on any error.
pub fn validate(config: &Config, source: &str) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("{source}: OK");
        return true;
    }
    let mut ok = true;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("warning: {issue}"),
            ConfigSeverity::Error => {
                println!("error: {issue}");
                ok = false;
            }
        }
    }
    ok
}

/// `config show`: effective config as TOML (secrets never live here).
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => println!("failed to render config: {e}"),
    }
}

/// `doctor`: check secrets, database, and provider reachability.
pub async fn doctor(config: &Config) -> bool {
    let mut passed = true;

    // Secrets.
    for (name, required) in [
        ("GATEWAY_AUTH_TOKEN", config.security.enforce_production_hardening),
        ("PERMISSION_SECRET", config.security.enforce_production_hardening),
        ("INTERNAL_AUTH_TOKEN", false),
    ] {
        match std::env::var(name) {
            Ok(value) if value.len() >= 32 => println!("ok: {name} set"),
            Ok(_) => {
                println!("warn: {name} is shorter than 32 characters");
                passed &= !required;
            }
            Err(_) if required => {
                println!("fail: {name} is required in production");
                passed = false;
            }
            Err(_) => println!("warn: {name} not set (dev mode)"),
        }
    }

    // Database.
    match crate::storage::connect(&config.database).await {
        Ok(Some(pool)) => {
            match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => println!("ok: database reachable"),
                Err(e) => {
                    println!("fail: database ping: {e}");
                    passed = false;
                }
            }
            pool.close().await;
        }
        Ok(None) => println!("warn: no database configured (in-memory stores)"),
        Err(e) => {
            println!("fail: database connect: {e}");
            passed = false;
        }
    }

    // Providers.
    match aegis_providers::ProviderRegistry::from_config(&config.llm) {
        Ok(registry) if registry.is_empty() => {
            println!("warn: no LLM providers initialized");
        }
        Ok(registry) => {
            for id in registry.ids() {
                if let Some(provider) = registry.get(&id) {
                    if provider.is_available().await {
                        println!("ok: provider '{id}' reachable");
                    } else {
                        println!("warn: provider '{id}' unreachable");
                    }
                }
            }
        }
        Err(e) => {
            println!("fail: provider init: {e}");
            passed = false;
        }
    }

    passed
}
