#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI binary: stdout is the output channel

mod app;
mod cli;
mod config;
mod config_check;
mod config_watcher;
mod executor;
mod injection;
mod protocol;
mod serve;
mod session_config;
mod tracing_setup;

use anyhow::{Context, Result};
use clap::Parser;
use ferry_core::{InjectOptions, SourceType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::app::{App, source_from_args};
use crate::cli::{Cli, Commands};
use crate::config::{Config, shared_config};
use crate::injection::InjectOutcome;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = tracing_setup::init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "ferry starting"
    );

    match cli.command {
        Commands::Check { format } => cmd_check(cli.config.as_deref(), &format),
        Commands::Policy {
            source,
            session,
            identity,
        } => cmd_policy(
            cli.config.as_deref(),
            &source,
            &session,
            identity.as_deref(),
        ),
        Commands::Inject {
            session,
            source,
            identity,
            priority,
            message,
        } => {
            cmd_inject(
                cli.config.as_deref(),
                &session,
                &source,
                identity.as_deref(),
                priority,
                message,
            )
            .await
        }
        Commands::Serve => cmd_serve(cli.config.as_deref()).await,
        Commands::Version => {
            println!("ferry {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf()
}

fn load_app(config_path: Option<&str>) -> Result<(App, PathBuf)> {
    let config_file = Config::find_config_path(config_path);
    let config = Config::load(&config_file)?;
    let app = App::build(shared_config(config), &config_dir(&config_file))?;
    Ok((app, config_file))
}

fn parse_source_type(source: &str) -> Result<SourceType> {
    source
        .parse()
        .with_context(|| format!("invalid --source '{source}'"))
}

// ---------------------------------------------------------------------------
// cmd_check: validate config without starting
// ---------------------------------------------------------------------------

#[allow(clippy::unnecessary_wraps)] // must return Result to match main's match arms
fn cmd_check(config_path: Option<&str>, format: &str) -> Result<()> {
    let config_file = Config::find_config_path(config_path);
    let report = config_check::validate_config(&config_file);

    match format {
        "json" => report.print_json(),
        _ => report.print_human(),
    }

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cmd_policy: show what a source may do in a session
// ---------------------------------------------------------------------------

fn cmd_policy(
    config_path: Option<&str>,
    source: &str,
    session: &str,
    identity: Option<&str>,
) -> Result<()> {
    let (app, _) = load_app(config_path)?;
    let source = source_from_args(parse_source_type(source)?, identity);

    let policy = app.engine.resolve(&source, session);
    let direct = app.engine.check_direct(&source, session);
    let route = match app.injector.forwards().route(&source, session) {
        ferry_policy::Route::Direct => serde_json::json!({"route": "direct"}),
        ferry_policy::Route::ViaGateway(gateway) => {
            serde_json::json!({"route": "gateway", "gateway": gateway})
        }
        ferry_policy::Route::Deny(reason) => serde_json::json!({"route": "deny", "reason": reason}),
    };

    let output = serde_json::json!({
        "session": session,
        "source": source,
        "policy": policy,
        "direct": direct,
        "route": route,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// cmd_inject: one message through the whole pipeline
// ---------------------------------------------------------------------------

async fn cmd_inject(
    config_path: Option<&str>,
    session: &str,
    source: &str,
    identity: Option<&str>,
    priority: i32,
    message: String,
) -> Result<()> {
    let (app, _) = load_app(config_path)?;
    app.install_executor(Arc::new(app.command_executor()));
    let source = source_from_args(parse_source_type(source)?, identity);

    let outcome = app
        .injector
        .inject(
            session,
            message.into(),
            source,
            InjectOptions::default().with_priority(priority),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if matches!(
        outcome,
        InjectOutcome::Denied { .. } | InjectOutcome::Blocked { .. }
    ) {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cmd_serve: JSON-lines control channel on stdin/stdout
// ---------------------------------------------------------------------------

async fn cmd_serve(config_path: Option<&str>) -> Result<()> {
    let (app, config_file) = load_app(config_path)?;
    app.install_executor(Arc::new(app.command_executor()));
    serve::run(Arc::new(app), config_file).await
}
