use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use ccmux::config::{Config, DEFAULT_PORT};
use ccmux::utils::paths;

#[derive(Parser)]
#[command(name = "ccmux")]
#[command(version)]
#[command(about = "Orchestrate coding-agent sessions in tmux windows with web terminals")]
#[command(long_about = "\
ccmux provisions and supervises interactive coding-agent sessions bound to
git worktrees. Each session is a tmux window attached to a ttyd web
terminal; the orchestrator proxies terminal traffic under /t/<sid>/, keeps
a durable session registry across restarts, and streams lifecycle events
to connected browser clients over a WebSocket.

Windows survive orchestrator restarts: stopping ccmux never kills your
agent sessions. On the next start they are rediscovered and can be
reattached from the browser.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    PORT                     HTTP port (default: 8080)
    RUST_LOG                 Log level filter (default: ccmux=info)
    CCMUX_TMUX_BIN           Terminal multiplexer binary (default: tmux)
    CCMUX_TTYD_BIN           Web-terminal binary (default: ttyd)
    CCMUX_CLOUDFLARED_BIN    Tunnel binary (default: cloudflared)
    CCMUX_AGENT_CMD          Command typed into new windows (default: claude)
    CCMUX_TUNNEL_NAME        Use a named tunnel instead of an ephemeral one
    CCMUX_TUNNEL_URL         Public URL served by the named tunnel

FILE LOCATIONS:
    ./data/sessions.db       Session registry (SQLite)
    ./logs/out.log           All log output
    ./logs/error.log         Warnings and errors only")]
struct Cli {
    /// Enable the public tunnel and require authentication for
    /// non-local requests
    #[arg(long, short = 'r')]
    remote: bool,

    /// Comma-separated allow-list of selectable repository paths
    #[arg(long, value_delimiter = ',')]
    repos: Vec<PathBuf>,

    /// HTTP port
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    paths::ensure_dirs()?;
    let _guards = init_tracing();

    let config = Config {
        port: cli.port,
        remote: cli.remote,
        allowed_repos: cli.repos,
        ..Config::default()
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(ccmux::api::server::run(config))
}

/// Stderr plus two append-mode files: everything to out.log, WARN and up
/// to error.log. The returned guards must outlive the process.
fn init_tracing() -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::filter::{EnvFilter, LevelFilter};

    let out_appender = tracing_appender::rolling::never(paths::logs_dir(), "out.log");
    let (out_writer, out_guard) = tracing_appender::non_blocking(out_appender);

    let error_appender = tracing_appender::rolling::never(paths::logs_dir(), "error.log");
    let (error_writer, error_guard) = tracing_appender::non_blocking(error_appender);

    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ccmux=info"))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(out_writer)
                .with_ansi(false)
                .with_filter(env_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(error_writer)
                .with_ansi(false)
                .with_filter(LevelFilter::WARN),
        )
        .init();

    vec![out_guard, error_guard]
}
