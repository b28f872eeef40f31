use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use harreplay::{
    config::Config,
    har::har_entries,
    host,
    index::{RecordingSetId, ReplayIndex},
    logging,
};
use serde_json::json;

const EXTENSION_ORIGIN_SCHEMES: [&str; 2] = ["chrome-extension://", "moz-extension://"];

#[derive(Debug, Parser)]
#[command(name = "harreplay", args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    launch: LaunchArgs,
}

/// Arguments the browser passes when it starts the native messaging host.
#[derive(Debug, Args, Default, PartialEq, Eq)]
struct LaunchArgs {
    #[arg(hide = true)]
    browser_args: Vec<String>,
    #[arg(long, hide = true)]
    parent_window: Option<String>,
}

impl LaunchArgs {
    fn extension_origin(&self) -> Option<&str> {
        self.browser_args
            .iter()
            .map(String::as_str)
            .find(|arg| EXTENSION_ORIGIN_SCHEMES.iter().any(|scheme| arg.starts_with(scheme)))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the native messaging host on stdin/stdout.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
        /// Extension origin used to resolve a relative neutral page.
        #[arg(long)]
        extension_origin: Option<String>,
    },
    /// Print the native messaging host manifest.
    Manifest {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Absolute path of the host binary (defaults to the running executable).
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print the endpoints a HAR file would replay.
    Inspect { har: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Serve {
            config,
            log_level,
            extension_origin,
        }) => run_host(config.as_deref(), log_level.as_deref(), extension_origin.as_deref()).await,
        None => run_host(None, None, cli.launch.extension_origin()).await,
        Some(Command::Manifest { config, path }) => {
            let config = Config::load(config.as_deref())?;
            let path = match path {
                Some(path) => path,
                None => std::env::current_exe().context("resolve current executable")?,
            };
            let manifest = host_manifest(&config, &path)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            Ok(())
        }
        Some(Command::Inspect { har }) => {
            print!("{}", inspect_har_file(&har)?);
            Ok(())
        }
    }
}

async fn run_host(
    config_path: Option<&Path>,
    log_level: Option<&str>,
    extension_origin: Option<&str>,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    logging::init(&config, log_level)?;
    eprintln!("{}", startup_summary(&config, extension_origin));
    host::serve(&config, extension_origin).await
}

fn startup_summary(config: &Config, extension_origin: Option<&str>) -> String {
    let config_source = config
        .source()
        .map(ToString::to_string)
        .unwrap_or_else(|| "defaults".to_owned());
    let storage_path = config
        .storage
        .as_ref()
        .map(|storage| storage.path.display().to_string())
        .unwrap_or_else(|| "disabled".to_owned());
    let admin_listen = config
        .admin
        .as_ref()
        .map(|admin| admin.listen.to_string())
        .unwrap_or_else(|| "disabled".to_owned());
    let admin_token = if config
        .admin
        .as_ref()
        .is_some_and(|admin| admin.api_token.is_some())
    {
        "[REDACTED]"
    } else {
        "none"
    };

    format!(
        "startup config: source={}, host={}, extension_origin={}, neutral_page={}, storage_path={}, admin_listen={}, admin_token={}",
        config_source,
        config.host.name,
        extension_origin.unwrap_or("none"),
        config.replay.neutral_page,
        storage_path,
        admin_listen,
        admin_token
    )
}

fn host_manifest(config: &Config, binary: &Path) -> anyhow::Result<serde_json::Value> {
    if !binary.is_absolute() {
        anyhow::bail!(
            "native messaging manifests need an absolute host path, got `{}`",
            binary.display()
        );
    }
    Ok(json!({
        "name": config.host.name,
        "description": config.host.description,
        "path": binary,
        "type": "stdio",
        "allowed_origins": config.host.allowed_origins,
    }))
}

fn inspect_har_file(path: &Path) -> anyhow::Result<String> {
    let raw = std::fs::read(path).with_context(|| format!("read HAR file {}", path.display()))?;
    let document: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("parse HAR file {}", path.display()))?;
    inspect_har(&path.display().to_string(), &document)
}

fn inspect_har(name: &str, document: &serde_json::Value) -> anyhow::Result<String> {
    let entries = har_entries(document)
        .ok_or_else(|| anyhow::anyhow!("`{name}` has no `log.entries` array"))?;
    let mut index = ReplayIndex::new();
    let report = index.load(RecordingSetId::generate(), name, entries);

    let mut out = String::new();
    for endpoint in index.list_endpoints() {
        out.push_str(&format!(
            "{} {} ({} recorded)\n",
            endpoint.method, endpoint.path, endpoint.count
        ));
    }
    out.push_str(&format!(
        "{} entries loaded, {} skipped\n",
        report.loaded(),
        report.skipped.len()
    ));
    for skipped in &report.skipped {
        out.push_str(&format!("  entry {}: {}\n", skipped.index, skipped.reason));
    }
    Ok(out)
}
