mod api;
mod cli;
mod config;
mod context;
mod guard;
mod logging;
mod nav;
mod session;
#[cfg(test)]
mod testing;

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "medadmin", about = "Hospital admin console")]
pub struct Args {
    #[arg(short, long, help = "Run a single command and exit (e.g. \"status\")")]
    pub command: Option<String>,

    #[arg(long, env = "MEDADMIN_HOST", help = "Base URL of the backend API")]
    pub api_host: Option<String>,

    #[arg(long, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Where to persist the session (overrides config)")]
    pub session_file: Option<PathBuf>,

    #[arg(long, help = "Keep the session in memory only")]
    pub ephemeral: bool,

    #[arg(long, help = "Verbose output (session events)")]
    pub verbose: bool,

    #[arg(long, help = "Debug output (HTTP requests and every session check)")]
    pub debug: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    logging::init(args.verbose, args.debug)?;

    let mut cfg = if let Some(config_path) = &args.config {
        config::Config::load_from(config_path)?
    } else {
        config::Config::load()?
    };

    // CLI and environment override config files
    if let Some(host) = &args.api_host {
        cfg.api_host = Some(host.clone());
    }
    if let Some(path) = &args.session_file {
        cfg.storage_path = Some(path.clone());
    }

    if let Err(errors) = cfg.validate() {
        let lines: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(anyhow!("Invalid configuration:\n  {}", lines.join("\n  ")));
    }
    let api_host = cfg.api_host.clone().unwrap_or_default();

    let storage: Box<dyn session::SessionStorage> = if args.ephemeral {
        info!("session kept in memory");
        Box::new(session::MemoryStorage::new())
    } else {
        let path = cfg.storage_path();
        info!(path = %path.display(), "session storage");
        Box::new(session::FileStorage::new(&path))
    };
    let store = Arc::new(session::TokenStore::open(storage));

    let api: Arc<dyn api::AuthApi> = Arc::new(api::HttpAuthApi::new(
        &api_host,
        cfg.session.request_timeout(),
    ));
    let navigator = Arc::new(nav::ShellNavigator::new(nav::Route::Login));

    let guard = guard::SessionGuard::new(
        Arc::clone(&store),
        Arc::clone(&api),
        navigator.clone(),
        Box::new(guard::SystemClock),
        cfg.session.refresh_window(),
    );
    let session = context::SessionContext::start(guard, cfg.session.check_interval())?;

    let ctx = cli::Context {
        api_host,
        session,
        api,
        navigator,
    };

    if let Some(command) = &args.command {
        let result = cli::run_once(&ctx, command);
        ctx.session.shutdown();
        result
    } else {
        cli::run_repl(ctx)
    }
}
