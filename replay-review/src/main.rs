use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use replay_review::config::AppConfig;
use replay_review::daemon::{self, read_pid};
use replay_review::jobs::{JobLogEntry, LogLevel};
use replay_review::logging::{LoggingConfig, init_logging};
use replay_review::services::ServiceContainer;
use replay_review::utils::http_client::install_rustls_provider;

enum Command {
    Daemon,
    Render(String),
    Status,
    Help,
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(Command::Help);
    }
    match args.get(1).map(String::as_str) {
        None | Some("daemon") => Ok(Command::Daemon),
        Some("status") => Ok(Command::Status),
        Some("render") => {
            let session_id = args
                .get(2)
                .filter(|id| !id.trim().is_empty())
                .context("render requires a session id")?;
            Ok(Command::Render(session_id.clone()))
        }
        Some(other) => anyhow::bail!("unknown command {other:?} (see --help)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = parse_args(&args)?;
    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = AppConfig::load().context("loading configuration")?;
    let (logging, _guard) = init_logging(&config.log_dir(), &config.log_filter)?;
    install_rustls_provider();

    let services = ServiceContainer::from_config(config)?;
    match command {
        Command::Daemon => {
            let runner = services.daemon_runner();
            let token = runner.cancellation_token();
            daemon::cancel_on_shutdown_signal(token.clone());
            logging.start_retention_cleanup(token.clone());
            runner.run().await?;
        }
        Command::Render(session_id) => render(&services, &session_id).await?,
        Command::Status => status(&services, &logging).await?,
        Command::Help => {}
    }
    Ok(())
}

async fn render(services: &ServiceContainer, session_id: &str) -> anyhow::Result<()> {
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<JobLogEntry>();
    let printer = tokio::spawn(async move {
        while let Some(entry) = log_rx.recv().await {
            match entry.level {
                LogLevel::Warn | LogLevel::Error => warn!("{}", entry.message),
                _ => info!("{}", entry.message),
            }
        }
    });

    let result = services.cache.ensure_rendered(session_id, Some(&log_tx)).await;
    drop(log_tx);
    let _ = printer.await;

    let rendered = result.with_context(|| format!("rendering session {session_id}"))?;
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

async fn status(services: &ServiceContainer, logging: &LoggingConfig) -> anyhow::Result<()> {
    let counts = services.jobs.counts().await?;
    let state = services.state.load().await?;
    let pid_path = services.config.pid_path();
    let daemon_pid = read_pid(&pid_path)
        .await?
        .filter(|pid| process_utils::is_pid_alive(*pid));
    let budget_mb = services.config.slots.max_render_memory_mb;

    match daemon_pid {
        Some(pid) => println!("Daemon:        running (pid {pid})"),
        None => println!("Daemon:        stopped"),
    }
    println!(
        "Jobs:          {} queued, {} running, {} complete, {} failed",
        counts.queued, counts.running, counts.complete, counts.failed
    );
    println!(
        "Render slots:  {} held, capacity {}",
        services.arbiter.held().await?.len(),
        services.arbiter.capacity(budget_mb)
    );
    println!(
        "Last pull:     {}",
        state
            .last_pulled_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "Backfill:      {}",
        match (state.backfill_started_at, state.backfill_completed_at) {
            (_, Some(done)) => format!("complete at {}", done.to_rfc3339()),
            (Some(started), None) => format!("in progress since {}", started.to_rfc3339()),
            (None, None) => "not started".to_string(),
        }
    );
    println!(
        "Pending:       {} users, {} groups",
        state.pending_user_emails.len(),
        state.pending_group_ids.len()
    );
    println!(
        "Logs:          {} ({})",
        logging.log_dir().display(),
        logging.get_filter()
    );
    Ok(())
}

fn print_help() {
    println!("replay-review - Render session replays and roll up their analyses");
    println!();
    println!("Usage:");
    println!("  replay-review [daemon]             # run the render-and-rollup daemon");
    println!("  replay-review render <session-id>  # render one session and print its cache entry");
    println!("  replay-review status               # show job counts and daemon state");
    println!();
    println!("Environment variables:");
    println!("  REPLAY_REVIEW_CONFIG=<path to JSON config>");
    println!("  REPLAY_REVIEW_DATA_DIR, REPLAY_REVIEW_SLOT_DIR, MAX_RENDER_MEMORY_MB");
    println!("  SOURCE_BASE_URL, SOURCE_PROJECT_ID, SOURCE_API_KEY");
    println!("  INFERENCE_ENDPOINT, INFERENCE_API_KEY");
    println!("  REPLAY_PLAYER, FFMPEG_PATH, FFPROBE_PATH, RCLONE_PATH, RUST_LOG");
}
