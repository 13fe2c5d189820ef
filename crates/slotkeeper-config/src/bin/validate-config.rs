//! Config validation CLI tool
//!
//! Validates a slotkeeperd configuration file and reports any errors.

use slotkeeper_config::{ConfigError, FleetConfig};
use slotkeeper_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a slotkeeperd configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            eprintln!("  validate-config config.example.toml");
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match slotkeeper_config::load_config(&config_path) {
        Ok(settings) => {
            let service = &settings.service;
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", slotkeeper_config::CURRENT_CONFIG_VERSION);
            println!("  Socket: {}", service.socket_path.display());
            match service.tcp_listen {
                Some(addr) => println!("  TCP listener: {}", addr),
                None => println!("  TCP listener: disabled"),
            }
            println!("  Data dir: {}", service.data_dir.display());
            println!(
                "  Admin token: {}",
                if service.admin_token.is_some() { "set" } else { "not set" }
            );
            println!("  Heartbeat: {}s", service.heartbeat.as_secs());
            match service.overstay_sweep {
                Some(period) => println!("  Overstay sweep: every {}s", period.as_secs()),
                None => println!("  Overstay sweep: disabled"),
            }

            println!();
            match &settings.slots {
                FleetConfig::Numbered(count) => {
                    println!("Initial fleet: {} auto-numbered slots", count);
                }
                FleetConfig::Named(ids) => {
                    println!("Initial fleet ({} slots):", ids.len());
                    for id in ids {
                        println!("  - {}", id);
                    }
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        slotkeeper_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
