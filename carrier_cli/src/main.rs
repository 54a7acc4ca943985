use anyhow::anyhow;
use carrier_cli::commands::{notify_all, start_responder};
use carrier_cli::config::{CliCommand, Config, GlobalOptions, NotifyCommand};
use carrier_cli::error::SettingsError;
use carrier_cli::settings::{default_config_path, CarrierSettings};
use clap::Parser;
use log::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config: Config = Config::parse();
    let (global_options, command) = config.to_parts();

    let result = match command {
        CliCommand::Init { force } => exec_init(force, global_options),
        CliCommand::Targets => exec_targets(global_options).await,
        CliCommand::Notify(cmd) => exec_notify(cmd, global_options).await,
        CliCommand::Respond => exec_respond(global_options).await,
    };

    if let Err(err) = result {
        eprintln!("** Error ** \n {err}");
        std::process::exit(1);
    }
}

fn exec_init(force: bool, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let path = options.config_file.unwrap_or_else(default_config_path);
    if path.exists() && !force {
        return Err(anyhow!("{} already exists. Use --force to overwrite it.", display(&path)));
    }
    let settings = CarrierSettings::starter();
    settings.save(&path)?;
    println!("Configuration with {} engines written to {}", settings.engines.len(), display(&path));
    for engine in &settings.engines {
        println!("  engine {} on {}", engine.id, engine.domain);
    }
    Ok(())
}

async fn exec_targets(options: GlobalOptions) -> Result<(), anyhow::Error> {
    let settings = load_settings(options.config_file)?;
    let rule = settings.routing.to_rule()?;
    println!("{} targets configured.", settings.targets.len());
    for entry in &settings.targets {
        let engine = match entry.transport.resolve().await {
            Ok(addr) => settings.engine_for(rule.as_ref(), &addr).map(|e| e.id.to_string()),
            Err(e) => {
                warn!("{e}");
                None
            }
        };
        println!(
            "{} as {} via engine {}",
            entry.transport,
            entry.auth.security_name(),
            engine.unwrap_or_else(|| "<none>".into())
        );
    }
    Ok(())
}

async fn exec_notify(cmd: NotifyCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let settings = load_settings(options.config_file)?;
    let payload = cmd.payload()?;
    info!("Sending {} byte notification to {} targets", payload.len(), settings.targets.len());
    let reports = notify_all(&settings, payload, Duration::from_millis(cmd.timeout_ms)).await?;
    let mut failures = 0;
    for report in &reports {
        if !matches!(&report.outcome, Ok(outcome) if outcome.is_success()) {
            failures += 1;
        }
        println!("{report}");
    }
    if failures > 0 {
        return Err(anyhow!("{failures} of {} notifications failed.", reports.len()));
    }
    Ok(())
}

async fn exec_respond(options: GlobalOptions) -> Result<(), anyhow::Error> {
    let settings = load_settings(options.config_file)?;
    let mut client = start_responder(&settings).await?;
    for transport in &settings.transports {
        let addr = client.local_addr(transport.key.clone()).await?;
        println!("Responding on {addr} ({})", transport.key);
    }
    tokio::signal::ctrl_c().await?;
    info!("Interrupted. Shutting down.");
    client.stop().await?;
    Ok(())
}

fn load_settings(path: Option<PathBuf>) -> Result<CarrierSettings, anyhow::Error> {
    let path = path.unwrap_or_else(default_config_path);
    info!("Loading configuration from {}", display(&path));
    match CarrierSettings::try_load(Some(&path)) {
        Ok(settings) => Ok(settings),
        Err(SettingsError::IoError(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(anyhow!("No configuration file found at {}. Use `carrier init` to create one.", display(&path)))
        }
        Err(err) => Err(anyhow!("Error reading configuration file: {err}")),
    }
}

fn display(path: &Path) -> &str {
    path.to_str().unwrap_or("[invalid utf-8 path]")
}
