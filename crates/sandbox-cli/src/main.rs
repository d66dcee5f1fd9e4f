//! Sandbox - build and run multi-service applications locally
//!
//! The `sandbox` command drives a local container engine:
//!
//! - `build`: build every buildable service of a plan on top of a base image
//! - `run`: start the latest build of every service until interrupted

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sandbox_core::{
    Application, BuildOrchestrator, BuildOutcome, Engine, Image, ProcessEngine, RevisionSpec,
    RunOrchestrator, SandboxConfig,
};

#[derive(Parser)]
#[command(name = "sandbox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and run multi-service applications in local containers", long_about = None)]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Container engine program
    #[arg(long, env = "SANDBOX_ENGINE", global = true)]
    engine: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every buildable service of an application
    Build {
        /// Base image the services are built on
        #[arg(short, long)]
        image: Option<String>,

        /// Extra environment variable for the application (KEY=VALUE)
        #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Application plan (JSON)
        #[arg(default_value = "sandbox.json")]
        plan: PathBuf,
    },

    /// Run the latest build of every service until interrupted
    Run {
        /// Application plan (JSON)
        #[arg(default_value = "sandbox.json")]
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    sandbox_core::init_tracing(cli.json, sandbox_core::level_for_verbosity(cli.verbose));

    let mut config = SandboxConfig::from_env();
    if let Some(engine) = cli.engine {
        config.engine_program = engine;
    }
    let engine: Arc<dyn Engine> = Arc::new(ProcessEngine::new(config.engine_program.clone()));

    match cli.command {
        Commands::Build { image, env, plan } => {
            let mut application = load_application(&plan).await?;
            application.merge_environment(env);
            cmd_build(engine, config, &application, image.as_deref()).await
        }
        Commands::Run { plan } => {
            let application = load_application(&plan).await?;
            cmd_run(engine, config, &application).await
        }
    }
}

async fn load_application(plan: &Path) -> Result<Application> {
    let username = std::env::var("USER").unwrap_or_else(|_| "sandbox".to_string());
    let application = Application::load(plan)
        .await
        .with_context(|| format!("Failed to load application plan {}", plan.display()))?;
    Ok(application.with_default_environment(&username))
}

async fn cmd_build(
    engine: Arc<dyn Engine>,
    config: SandboxConfig,
    application: &Application,
    image: Option<&str>,
) -> Result<()> {
    let base = match image {
        Some(image) => {
            let spec = RevisionSpec::parse(image).context("Invalid base image")?;
            let base = Image::lookup(engine, &spec)
                .await
                .with_context(|| format!("Failed to find base image {image}"))?;
            Some(base)
        }
        None => None,
    };

    let outcome = BuildOrchestrator::new(config)
        .build(application, base.as_ref())
        .await
        .with_context(|| format!("Failed to build {}", application.name))?;

    match outcome {
        BuildOutcome::NothingToBuild => {
            warn!(application = %application.name, "nothing to build");
        }
        BuildOutcome::Built(images) => {
            for (service, image) in &images {
                println!("{service}: {image}");
            }
            info!(services = images.len(), "build done");
        }
    }
    Ok(())
}

async fn cmd_run(
    engine: Arc<dyn Engine>,
    config: SandboxConfig,
    application: &Application,
) -> Result<()> {
    let token = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(token.clone()));

    let outcome = RunOrchestrator::new(engine, config)
        .run(application, token)
        .await;
    signals.abort();

    if let Err(e) = outcome {
        let not_built = e.not_built_services();
        if !not_built.is_empty() {
            bail!(
                "{} not built yet, run `sandbox build` first ({e})",
                not_built.join(", ")
            );
        }
        return Err(e).with_context(|| format!("Failed to run {}", application.name));
    }
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("stopping services, please wait");
    token.cancel();
    Ok(())
}

/// Parse a `KEY=VALUE` pair; keys start with a letter.
fn parse_env_pair(pair: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("{pair:?} isn't in the KEY=VALUE form"))?;
    let mut chars = key.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(format!("{key:?} isn't a valid environment variable name"));
    }
    Ok((key.to_string(), value.to_string()))
}
