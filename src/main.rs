//! filemailer CLI entry point.
//!
//! Provides `init`, `start`, `serve`, `token`, and `send` subcommands.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use teloxide::Bot;
use tracing::{info, warn};

use filemailer::approval::ApprovalService;
use filemailer::config::{self, Config, RuntimePaths, DEFAULT_CONFIG_TOML};
use filemailer::credentials::{load_credentials, write_env_template, Credentials};
use filemailer::joblog::JobLog;
use filemailer::mail::SmtpMailer;
use filemailer::pipeline::{DeliveryPipeline, PipelineConfig};
use filemailer::store::Store;
use filemailer::telegram::{self, BotState, TelegramNotifier};
use filemailer::{auth, http, logging};

/// filemailer: fetch linked files and mail them as attachments.
#[derive(Parser)]
#[command(name = "filemailer", version, about)]
struct Cli {
    /// Runtime directory (default `~/.filemailer`).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Config file (default `<root>/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Write a starter config and an empty credentials file.
    Init,
    /// Run the Telegram bot and the HTTP service.
    Start,
    /// Run the HTTP service only.
    Serve,
    /// Print a freshly generated access token.
    Token,
    /// Run one delivery and print the outcome.
    Send {
        /// Access token of the recipient.
        #[arg(long)]
        api_key: String,
        /// URL to fetch.
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Token = cli.command {
        println!("{}", auth::generate_token().expose());
        return Ok(());
    }

    let paths = match &cli.root {
        Some(root) => RuntimePaths::under(root),
        None => config::runtime_paths()?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| paths.config_file.clone());

    match cli.command {
        Command::Init => handle_init(&paths, &config_path),
        Command::Start => handle_start(&paths, &config_path, true).await,
        Command::Serve => handle_start(&paths, &config_path, false).await,
        Command::Send { api_key, url } => handle_send(&paths, &config_path, &api_key, &url).await,
        Command::Token => Ok(()),
    }
}

/// Write the starter files without overwriting existing ones.
fn handle_init(paths: &RuntimePaths, config_path: &Path) -> anyhow::Result<()> {
    logging::init_cli();

    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("failed to create {}", paths.root.display()))?;

    if config_path.exists() {
        println!("config exists: {}", config_path.display());
    } else {
        std::fs::write(config_path, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        println!("wrote {}", config_path.display());
    }

    if write_env_template(&paths.env_file)? {
        println!("wrote {}", paths.env_file.display());
    } else {
        println!("credentials exist: {}", paths.env_file.display());
    }

    Ok(())
}

/// Long-running service. `with_bot` adds the Telegram front-end.
async fn handle_start(
    paths: &RuntimePaths,
    config_path: &Path,
    with_bot: bool,
) -> anyhow::Result<()> {
    let _logging_guard = logging::init_production(&paths.logs_dir)?;

    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let credentials = load_credentials(&paths.env_file)
        .with_context(|| format!("failed to load {}", paths.env_file.display()))?;

    let store = Store::open(&config.database_path(paths)).await?;
    let pipeline = Arc::new(build_pipeline(&config, paths, &credentials, &store)?);

    info!(
        config = %config_path.display(),
        bot = with_bot,
        http = config.http.enabled,
        "filemailer starting"
    );

    if !with_bot {
        let listener = http::bind(&config.http.listen).await?;
        return http::serve(listener, pipeline, shutdown_signal()).await;
    }

    let bot_token = credentials.bot_token(&config.telegram)?;
    let bot = Bot::new(bot_token);
    let approvals = ApprovalService::new(
        store.clone(),
        Arc::new(TelegramNotifier::new(bot.clone())),
        config.telegram.admin_chat_id,
    );
    let state = BotState {
        store,
        approvals,
        pipeline: Arc::clone(&pipeline),
    };

    let http_task = if config.http.enabled {
        let listener = http::bind(&config.http.listen).await?;
        let pipeline = Arc::clone(&pipeline);
        Some(tokio::spawn(http::serve(listener, pipeline, shutdown_signal())))
    } else {
        None
    };

    telegram::run_telegram(bot, state).await?;

    if let Some(task) = http_task {
        match task.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "http task panicked"),
        }
    }
    info!("filemailer stopped");
    Ok(())
}

/// One delivery from the command line.
async fn handle_send(
    paths: &RuntimePaths,
    config_path: &Path,
    api_key: &str,
    url: &str,
) -> anyhow::Result<()> {
    logging::init_cli();

    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let credentials = load_credentials(&paths.env_file)
        .with_context(|| format!("failed to load {}", paths.env_file.display()))?;
    let store = Store::open(&config.database_path(paths)).await?;
    let pipeline = build_pipeline(&config, paths, &credentials, &store)?;

    match pipeline.deliver(api_key, url).await {
        Ok(receipt) => {
            println!(
                "sent {} ({} bytes) to {}",
                receipt.filename, receipt.size, receipt.email
            );
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(
            "{} ({}): {}",
            e.stage().as_str(),
            e.kind().as_str(),
            e.user_message()
        )),
    }
}

fn build_pipeline(
    config: &Config,
    paths: &RuntimePaths,
    credentials: &Credentials,
    store: &Store,
) -> anyhow::Result<DeliveryPipeline> {
    let password = credentials.smtp_password(&config.smtp)?;
    let mailer = SmtpMailer::from_config(&config.smtp, password)
        .context("failed to configure SMTP")?;
    let job_log = JobLog::open(config.job_log_path(paths))
        .context("failed to open job log")?;

    DeliveryPipeline::new(
        Arc::new(store.clone()),
        Arc::new(mailer),
        Arc::new(job_log),
        PipelineConfig::from_config(config, paths),
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
