// Main binary: runs the orchestrator or validates templates
use anvil_crd::{compile, flatten, render};
use anvil_server::{run as run_server, ServerConfig, DEFAULT_PORT};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use std::collections::HashMap;
use std::io::stderr;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Anvil bare metal workflow orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the workflow orchestrator
    Serve(ServeArgs),
    /// Compile a template and print its flattened action list
    Validate(ValidateArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "ANVIL_BIND", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// SQLite database file; state is kept in memory when omitted
    #[arg(long, env = "ANVIL_DATABASE")]
    database: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Template file (YAML)
    file: PathBuf,

    /// Device substitutions, e.g. --device device_1=00:11:22:33:44:55
    #[arg(long = "device", value_parser = parse_device)]
    devices: Vec<(String, String)>,
}

fn parse_device(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "anvil={level},anvil_server={level},anvil_workflow={level},tower_http=warn,sqlx=warn,hyper=warn",
        level = default_level
    );
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Validate(args) => validate(args),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = ServerConfig::default().with_bind(args.bind);
    if let Some(path) = args.database {
        config = config.with_database(path);
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
            trigger.cancel();
        }
    });

    run_server(config, shutdown)
        .await
        .map_err(|e| color_eyre::eyre::eyre!("{:#}", e))
}

fn validate(args: ValidateArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.file)
        .wrap_err_with(|| format!("Failed to read {}", args.file.display()))?;

    let devices: HashMap<String, String> = args.devices.into_iter().collect();
    let rendered = if devices.is_empty() {
        raw
    } else {
        render(&raw, &devices)?
    };
    let workflow = compile(rendered.as_bytes())?;
    let actions = flatten(&workflow);

    println!(
        "{}",
        serde_json::to_string_pretty(&actions).wrap_err("Failed to encode action list")?
    );
    info!(
        workflow = %workflow.name,
        tasks = workflow.tasks.len(),
        actions = actions.len(),
        "Template is valid"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(
            parse_device("device_1=00:11:22:33:44:55").unwrap(),
            ("device_1".to_string(), "00:11:22:33:44:55".to_string())
        );
        assert!(parse_device("device_1").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "anvil",
            "validate",
            "t.yaml",
            "--device",
            "device_1=W1",
        ])
        .unwrap();
        match cli.command {
            Commands::Validate(args) => assert_eq!(args.devices.len(), 1),
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["anvil", "serve", "--database", "/tmp/a.db"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve(ServeArgs { database: Some(_), .. })));
    }
}
