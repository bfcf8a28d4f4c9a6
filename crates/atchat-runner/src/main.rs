//! `atchat`: talk AT to a modem behind a TCP serial bridge.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atchat_runner::{
    run_session, ChatScript, CommandSpec, CommandStatus, RunnerError, SessionOptions,
    SessionSummary,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "atchat", about = "Run AT commands against a modem over TCP")]
struct Cli {
    /// Modem address, host:port.
    #[arg(long, default_value = "127.0.0.1:7000")]
    connect: String,

    /// YAML script with channel settings, notifications and commands.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Extra command to send after the script's; repeatable.
    #[arg(short = 'c', long = "command")]
    commands: Vec<String>,

    /// Keep listening for notifications this long after the last command.
    #[arg(long)]
    listen_secs: Option<u64>,

    /// Dump raw traffic to stderr.
    #[arg(long)]
    debug: bool,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    atchat_metrics::describe_metrics();

    match run(cli) {
        Ok(summary) => {
            print_summary(&summary);
            if summary.all_ok() && !summary.disconnected {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            error!(%err, "session failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<SessionSummary, RunnerError> {
    let mut script = match &cli.script {
        Some(path) => ChatScript::load(path)?,
        None => ChatScript::default(),
    };
    script
        .commands
        .extend(cli.commands.iter().map(CommandSpec::new));
    if let Some(secs) = cli.listen_secs {
        script.listen_secs = secs;
    }
    script.validate()?;

    let options = SessionOptions {
        listen: Duration::from_secs(script.listen_secs),
        debug: cli.debug,
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(err) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
            error!(%err, "cannot install Ctrl-C handler");
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(connect_and_run(&cli.connect, &script, &options, stop))
}

async fn connect_and_run(
    address: &str,
    script: &ChatScript,
    options: &SessionOptions,
    stop: Arc<AtomicBool>,
) -> Result<SessionSummary, RunnerError> {
    info!(%address, "connecting");
    let stream = tokio::net::TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    run_session(stream, script, options, stop).await
}

fn print_summary(summary: &SessionSummary) {
    for outcome in &summary.commands {
        let status = match outcome.status {
            CommandStatus::Ok => "OK",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Canceled => "CANCELED",
            CommandStatus::Pending => "PENDING",
        };
        println!("{} [{}]", outcome.command, status);
        for line in &outcome.lines {
            println!("    {line}");
        }
        if let Some(final_line) = &outcome.final_line {
            println!("    {final_line}");
        }
    }

    for record in &summary.notifications {
        println!("{} {}", record.prefix, record.lines.join(" | "));
        if let Some(pdu) = &record.pdu {
            println!("    {pdu}");
        }
    }

    if summary.disconnected {
        println!("modem disconnected");
    }
}
