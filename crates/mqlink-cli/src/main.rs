//! mqlink - Run a scripted MQTT session against a broker.

mod config;
mod runner;

use log::{error, info};

use crate::config::Config;
use crate::runner::Runner;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "mqlink.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-V" | "--version" => {
                println!(
                    "mqlink {} (build {})",
                    mqlink_client::VERSION,
                    mqlink_client::BUILD_NUMBER
                );
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("mqlink - Scripted MQTT session runner");
                println!();
                println!("Usage: mqlink [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: mqlink.toml)");
                println!("  -V, --version           Print version information");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format: [log], [broker], [will], [session]");
                println!("  and a [[steps]] list. Settings can be overridden with environment");
                println!("  variables using the MQLINK__ prefix:");
                println!();
                println!("  MQLINK__BROKER__HOST=broker.local");
                println!("  MQLINK__BROKER__PORT=8883");
                println!("  MQLINK__SESSION__OPERATION_TIMEOUT_MS=1000");
                println!("  MQLINK__LOG__LEVEL=debug");
                println!();
                println!("Exit status is 0 only if every step succeeded.");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    info!(
        "mqlink {} loaded {} with {} steps",
        mqlink_client::VERSION,
        args.config_path,
        config.steps.len()
    );

    let mut runner = match Runner::new(&config) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to start session: {}", e);
            std::process::exit(1);
        }
    };

    let report = match runner.run(&config.steps) {
        Ok(report) => report,
        Err(e) => {
            error!("Connect failed: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "{} passed, {} failed, {} messages received",
        report.passed, report.failed, report.messages
    );
    drop(runner);
    std::process::exit(if report.success() { 0 } else { 1 });
}
