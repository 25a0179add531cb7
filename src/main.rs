// Lucy — server binary.
//
// Modes:
//   lucy run              Socket Mode listener (outbound WebSocket)
//   lucy run --http       HTTP receiver mode (events + Spaces callbacks)
//   lucy run --force      Terminate an existing instance first
//
// Exit codes: 0 graceful, 1 fatal, 1 when another instance holds the lock.

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use lucy::engine::config::Settings;
use lucy::engine::http_api::{build_router, ApiState};
use lucy::engine::slack::SocketModeListener;
use lucy::engine::state::EngineState;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lucy", about = "Lucy — workspace-scoped AI coworker for Slack")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default).
    Run {
        /// Use HTTP receiver mode instead of Socket Mode.
        #[arg(long)]
        http: bool,
        /// Port for HTTP mode.
        #[arg(long, default_value_t = 3000)]
        port: u16,
        /// Terminate an existing instance before starting.
        #[arg(long)]
        force: bool,
    },
}

fn pid_file() -> PathBuf {
    std::env::temp_dir().join("lucy_bot.pid")
}

/// Single-instance lock. Returns false when another live Lucy holds it.
fn check_single_instance(force: bool) -> bool {
    let path = pid_file();
    if let Ok(content) = std::fs::read_to_string(&path) {
        if let Ok(old_pid) = content.trim().parse::<u32>() {
            let alive = PathBuf::from(format!("/proc/{}", old_pid)).exists();
            if alive && force {
                warn!("Killing existing Lucy (PID {}) due to --force", old_pid);
                let _ = std::process::Command::new("kill")
                    .arg(old_pid.to_string())
                    .status();
                std::thread::sleep(std::time::Duration::from_secs(1));
            } else if alive {
                eprintln!("ERROR: Lucy is already running (PID {})", old_pid);
                eprintln!("To stop it: kill {}", old_pid);
                eprintln!("Or start with: lucy run --force");
                return false;
            }
        }
        let _ = std::fs::remove_file(&path);
    }
    if let Err(e) = std::fs::write(&path, std::process::id().to_string()) {
        warn!("Could not write PID file: {}", e);
    }
    true
}

fn cleanup_pid() {
    let _ = std::fs::remove_file(pid_file());
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (http, port, force) = match cli.command {
        Some(Command::Run { http, port, force }) => (http, port, force),
        None => (false, 3000, false),
    };

    env_logger::Builder::new()
        .parse_filters(&std::env::var("LUCY_LOG_LEVEL").unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    if !check_single_instance(force) {
        return ExitCode::from(1);
    }

    let port = if port == 3000 && settings.http_port != 3000 {
        settings.http_port
    } else {
        port
    };

    let state = match EngineState::new(settings) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to initialize engine: {}", e);
            cleanup_pid();
            return ExitCode::from(1);
        }
    };

    state.start_background();
    state.probe_gateway().await;

    let result = if http {
        run_http(state, port).await
    } else {
        run_socket_mode(state).await
    };

    cleanup_pid();
    match result {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run_socket_mode(state: Arc<EngineState>) -> lucy::atoms::error::EngineResult<()> {
    info!("Starting Lucy in Socket Mode");
    let listener = SocketModeListener::new(
        &state.settings.slack_bot_token,
        &state.settings.slack_app_token,
        state.pipeline.clone(),
    );
    let stop = listener.stop_signal();

    tokio::select! {
        result = listener.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received — shutting down");
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
    }
}

async fn run_http(state: Arc<EngineState>, port: u16) -> lucy::atoms::error::EngineResult<()> {
    info!("Starting Lucy in HTTP mode on port {}", port);
    let api_state = ApiState {
        pipeline: state.pipeline.clone(),
        provider: state.provider.clone(),
        gateway: state.gateway.clone(),
        mailer: None,
        workspace_root: state.settings.workspace_root.clone(),
        search_model: "google/gemini-2.5-flash".to_string(),
    };
    let router = build_router(api_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(lucy::atoms::error::EngineError::from)?;

    tokio::select! {
        result = axum::serve(listener, router) => {
            result.map_err(|e| lucy::atoms::error::EngineError::Other(e.to_string()))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received — shutting down");
            Ok(())
        }
    }
}
