//! Command-line front-end.

use std::ffi::OsString;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;
use logging::{LogConfig, LogFormat, LogLevel, init_tracing};
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, ExitCode};
use crate::server::Server;

const LOG_TARGET: &str = "meta_proxy::daemon";
const MAX_EXIT_CODE: i32 = 255;

/// Generic layer-7 proxy for multiplexed binary RPC protocols.
#[derive(Debug, Parser)]
#[command(name = "meta-proxy", version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Default log level; RUST_LOG overrides it.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Log line format: full, compact or json.
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Disable ANSI colours in log output.
    #[arg(long)]
    no_ansi: bool,

    /// Worker threads of the async runtime.
    #[arg(long, value_name = "N")]
    threads: Option<NonZeroUsize>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

impl Args {
    fn log_config(&self, file: Option<LogConfig>) -> LogConfig {
        let mut config = file.unwrap_or_default();
        if let Some(level) = self.log_level {
            config = config.with_level(level);
        }
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        if self.no_ansi {
            config = config.with_ansi(false);
        }
        config
    }
}

/// Parses `arguments`, runs the daemon and returns the process exit status.
///
/// Help and version output go to `stdout`; diagnostics to `stderr`.
pub fn run<I, S, Out, Err>(arguments: I, stdout: &mut Out, stderr: &mut Err) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
    Out: Write,
    Err: Write,
{
    let args = match Args::try_parse_from(arguments) {
        Ok(args) => args,
        Err(error) => {
            return match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    if write!(stdout, "{error}").is_err() {
                        return ExitCode::Usage.as_i32();
                    }
                    ExitCode::Ok.as_i32()
                }
                _ => {
                    let _ = write!(stderr, "{error}");
                    ExitCode::Usage.as_i32()
                }
            };
        }
    };

    match execute(&args, stdout) {
        Ok(()) => ExitCode::Ok.as_i32(),
        Err(error) => {
            let _ = writeln!(stderr, "meta-proxy: {error}");
            error.exit_code()
        }
    }
}

fn execute<Out: Write>(args: &Args, stdout: &mut Out) -> Result<(), DaemonError> {
    let config = DaemonConfig::load(&args.config)?;
    if args.check {
        let _ = writeln!(
            stdout,
            "{}: ok ({} codec, {} routes, {} clusters)",
            args.config.display(),
            config.codec,
            config.route_config.routes.len(),
            config.clusters.len()
        );
        return Ok(());
    }

    init_tracing(&args.log_config(config.log))?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = args.threads {
        runtime.worker_threads(threads.get());
    }
    let runtime = runtime.build().map_err(DaemonError::Runtime)?;
    runtime.block_on(serve(&config))
}

async fn serve(config: &DaemonConfig) -> Result<(), DaemonError> {
    let server = Server::bind(config).await?;
    let handle = server.shutdown_handle();
    let stats = server.stats();
    let clusters = server.clusters();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(target: LOG_TARGET, "interrupt received"),
            Err(error) => warn!(target: LOG_TARGET, %error, "cannot listen for interrupts"),
        }
        handle.shutdown();
    });

    server.serve().await?;

    match serde_json::to_string(&stats.snapshot()) {
        Ok(snapshot) => info!(target: LOG_TARGET, stats = %snapshot, "final stats"),
        Err(error) => warn!(target: LOG_TARGET, %error, "failed to serialize stats"),
    }
    for (cluster, host, host_stats) in clusters.host_stats() {
        info!(
            target: LOG_TARGET,
            %cluster,
            %host,
            connect_success = host_stats.connect_success,
            connect_failed = host_stats.connect_failed,
            timeout = host_stats.timeout,
            request_success = host_stats.request_success,
            request_failed = host_stats.request_failed,
            "upstream host stats"
        );
    }
    Ok(())
}

/// Converts a status returned by [`run`] into a process exit code.
#[must_use]
pub fn exit_code_from(status: i32) -> std::process::ExitCode {
    let clamped = status.clamp(0, MAX_EXIT_CODE);
    std::process::ExitCode::from(u8::try_from(clamped).unwrap_or(u8::MAX))
}
