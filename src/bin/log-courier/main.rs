// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use log_courier::admin::{Navigable, Node};
use log_courier::agent::{self, Agent, BoxError, Reloader, wait};
use log_courier::codecs::CodecRegistry;
use log_courier::config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the shipper
    Start(Box<StartArgs>),

    /// Return version
    Version,
}

#[derive(Debug, clap::Args)]
struct StartArgs {
    /// Configuration file (JSON)
    #[arg(long, short = 'c', env = "LOG_COURIER_CONFIG")]
    config: PathBuf,

    /// Read files found on the first run from the beginning instead of the end
    #[arg(long, default_value = "false")]
    from_beginning: bool,

    /// Ship standard input instead of the configured files
    #[arg(long, default_value = "false")]
    stdin: bool,

    /// Validate the configuration and exit
    #[arg(long, default_value = "false")]
    config_test: bool,
}

#[derive(Debug, Parser)]
#[command(name = "log-courier")]
#[command(bin_name = "log-courier")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOG_COURIER_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(args)) => {
            let registry = CodecRegistry::builtin();

            if args.config_test {
                return match agent::test_config(&args.config, &registry) {
                    Ok(_) => {
                        println!("Configuration OK: {}", args.config.display());
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Configuration test failed: {}", e);
                        ExitCode::from(1)
                    }
                };
            }

            // Configuration errors abort before anything is started.
            let config = match Config::load(&args.config, &registry) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("ERROR: failed to load {}: {}", args.config.display(), e);
                    return ExitCode::from(1);
                }
            };

            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = run_agent(args, config, registry) {
                error!(error = %e, "Failed to run log-courier.");
                return ExitCode::from(1);
            }
        }
        _ => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_agent(
    args: Box<StartArgs>,
    config: Config,
    registry: CodecRegistry,
) -> Result<(), BoxError> {
    let mut agent_join_set = JoinSet::new();

    let reloader = Reloader::new(config, Some(args.config.clone()), registry);
    let agent = Agent::new(reloader.clone())
        .with_from_beginning(args.from_beginning)
        .with_stdin(args.stdin);
    let admin = agent.admin();

    let cancel_token = CancellationToken::new();
    agent_join_set.spawn(agent.run(cancel_token.clone()));

    let mut shutdown = signals::Shutdown::new()?;
    let mut reload = signals::Reload::new()?;
    let mut snapshot = signals::Snapshot::new()?;
    loop {
        select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received.");
                cancel_token.cancel();
                break;
            },
            _ = reload.recv() => {
                info!("Signal SIGHUP received, reloading configuration");
                if let Err(e) = reloader.reload() {
                    error!(error = %e, "Configuration reload failed, keeping the running configuration");
                }
            },
            _ = snapshot.recv() => {
                log_admin_tree(&admin);
            },
            e = wait::wait_for_any_task(&mut agent_join_set) => {
                e?;
                info!("Finished.");
                return Ok(());
            },
        }
    }

    // A second signal skips the orderly shutdown.
    select! {
        e = wait::wait_for_all_tasks(&mut agent_join_set) => e,
        _ = shutdown.recv() => {
            warn!("Second shutdown signal received, exiting immediately");
            Err("forced shutdown".into())
        }
    }
}

fn log_admin_tree(admin: &Arc<Node>) {
    if let Err(e) = admin.update() {
        warn!(error = %e, "Failed to refresh admin tree");
    }
    info!("Status snapshot:\n{}", admin.human_readable(""));
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init().map_err(|e| format!("unable to setup log tracer: {}", e))?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("rustls=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(stdout_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

#[cfg(unix)]
mod signals {
    use std::io;
    use tokio::select;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    pub struct Shutdown {
        term: Signal,
        int: Signal,
    }

    impl Shutdown {
        pub fn new() -> io::Result<Self> {
            Ok(Self {
                term: signal(SignalKind::terminate())?,
                int: signal(SignalKind::interrupt())?,
            })
        }

        pub async fn recv(&mut self) {
            select! {
                _ = self.term.recv() => {},
                _ = self.int.recv() => {},
            }
        }
    }

    pub struct Reload(Signal);

    impl Reload {
        pub fn new() -> io::Result<Self> {
            Ok(Self(signal(SignalKind::hangup())?))
        }

        pub async fn recv(&mut self) {
            self.0.recv().await;
        }
    }

    /// SIGUSR1 logs the admin tree.
    pub struct Snapshot(Signal);

    impl Snapshot {
        pub fn new() -> io::Result<Self> {
            Ok(Self(signal(SignalKind::user_defined1())?))
        }

        pub async fn recv(&mut self) {
            self.0.recv().await;
        }
    }
}

#[cfg(not(unix))]
mod signals {
    use std::io;

    pub struct Shutdown;

    impl Shutdown {
        pub fn new() -> io::Result<Self> {
            Ok(Self)
        }

        pub async fn recv(&mut self) {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    // Only interrupt is available off unix.
    pub struct Reload;

    impl Reload {
        pub fn new() -> io::Result<Self> {
            Ok(Self)
        }

        pub async fn recv(&mut self) {
            std::future::pending::<()>().await;
        }
    }

    pub type Snapshot = Reload;
}
