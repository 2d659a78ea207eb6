mod pipeline;

use std::path::PathBuf;
use std::process::ExitCode;

use agentload_core::config::default_config_path;
use agentload_core::{Config, CredentialStore};
use agentload_secret_service::SecretServiceStore;
use agentload_ssh_agent::Constraint;
use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use crate::pipeline::{LoadError, LoadRequest, Pipeline};

const USAGE: &str = "\
agentload - add a passphrase-protected SSH key to the running ssh-agent

USAGE:
    agentload [options] [KEY]

ARGS:
    KEY                    Key container to load (default: [key] path, else ~/.ssh/id_rsa)

OPTIONS:
    -c, --config <path>    Path to config file (default: $XDG_CONFIG_HOME/agentload/config.toml)
    -v, --verbose          Log pipeline progress to stderr (RUST_LOG overrides)
    -h, --help             Show this help message

The passphrase is looked up in the desktop keyring under
service=<KEY path>, description=\"ssh key passphrase\".  The agent is
reached through $SSH_AUTH_SOCK.";

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    verbose: bool,
    key: Option<PathBuf>,
}

/// Parse command-line arguments.  `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<Args>> {
    let mut out = Args::default();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-h" | "--help" => return Ok(None),
            "-v" | "--verbose" => out.verbose = true,
            "-c" | "--config" => {
                i += 1;
                let Some(path) = args.get(i) else {
                    bail!("{arg} requires a path argument");
                };
                out.config = Some(PathBuf::from(path));
            }
            _ if arg.starts_with("--config=") => {
                out.config = Some(PathBuf::from(&arg["--config=".len()..]));
            }
            _ if arg.starts_with('-') && arg != "-" => bail!("unknown option: {arg}"),
            _ => {
                if out.key.is_some() {
                    bail!("unexpected argument: {arg}");
                }
                out.key = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }
    Ok(Some(out))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_request(config: &Config, key: Option<&std::path::Path>) -> Result<LoadRequest> {
    let key_path = config.key_path(key).context("resolving key path")?;
    let agent_socket = config.agent_socket().context("resolving agent socket")?;

    let mut constraints = Vec::new();
    if let Some(secs) = config.agent.lifetime_secs {
        constraints.push(Constraint::Lifetime(secs));
    }
    if config.agent.confirm {
        constraints.push(Constraint::Confirm);
    }

    let mut req = LoadRequest::new(key_path, agent_socket);
    req.comment = config.key.comment.clone();
    req.description = config.credential.description.clone();
    req.credential_timeout = config.credential_timeout();
    req.agent_timeout = config.agent_timeout();
    req.constraints = constraints;
    Ok(req)
}

fn load_request(args: &Args) -> Result<LoadRequest> {
    let config_path = match &args.config {
        Some(p) => p.clone(),
        None => default_config_path().context("locating config file")?,
    };
    let config = Config::load(&config_path)?;
    tracing::debug!(path = %config_path.display(), "config loaded");
    build_request(&config, args.key.as_deref())
}

/// Resolve config into a request and run it.
async fn run(args: &Args, store: &dyn CredentialStore) -> ExitCode {
    let request = match load_request(args) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    load(&request, store).await
}

async fn load(request: &LoadRequest, store: &dyn CredentialStore) -> ExitCode {
    match Pipeline::new(store).run(request).await {
        Ok(loaded) => {
            tracing::info!(fingerprint = %loaded.fingerprint, "key loaded");
            println!(
                "Successfully added {} to running ssh-agent",
                loaded.key_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::debug!(
                stage = %e.stage(),
                identifier = e.identifier().as_deref().unwrap_or("-"),
                "pipeline failed"
            );
            eprintln!("{}", failure_line(&e));
            ExitCode::FAILURE
        }
    }
}

fn failure_line(e: &LoadError) -> String {
    format!("error: {}: {e}", e.kind())
}

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Try 'agentload --help' for more information.");
            return ExitCode::FAILURE;
        }
    };

    init_logging(args.verbose);

    run(&args, &SecretServiceStore::session()).await
}
