//! pmiserv: standalone rendezvous server for one parallel job.
//!
//! Listens for PMI-1 and PMI-2 worker connections, serves a single process
//! group of `--size` members, and prints the bound port so the launcher can
//! hand it to the workers.
//!
//! # Usage
//!
//! ```text
//! pmiserv --size 4 --port 0 --exit-on-completion
//! ```

use clap::Parser;
use clap::builder::RangedU64ValueParser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pmiserv::server::{self, ServerConfig};
use pmiserv::{ServiceConfig, VersionInfo};

#[derive(Parser, Debug)]
#[command(name = "pmiserv", version, about = "Process-group rendezvous server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "PMISERV_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on; 0 picks a free one.
    #[arg(long, env = "PMISERV_PORT", default_value = "0")]
    port: u16,

    /// Number of processes in the job.
    #[arg(
        long,
        short = 'n',
        env = "PMISERV_SIZE",
        default_value = "1",
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    size: usize,

    /// Reject repeated KVS keys instead of appending them.
    #[arg(long, env = "PMISERV_STRICT_KEYS")]
    strict_keys: bool,

    /// Universe size reported to workers. Defaults to --size.
    #[arg(long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    universe_size: Option<usize>,

    /// Application number reported to workers.
    #[arg(long, default_value = "0")]
    appnum: i32,

    /// Report the job as being debugged.
    #[arg(long)]
    debug: bool,

    /// Exit once every process has finalized or died.
    #[arg(long)]
    exit_on_completion: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut service = ServiceConfig::new()
            .with_strict_keys(self.strict_keys)
            .with_appnum(self.appnum)
            .with_debug(self.debug);
        if let Some(size) = self.universe_size {
            service = service.with_universe_size(size);
        }

        ServerConfig::new()
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_group_size(self.size)
            .with_service(service)
            .with_exit_on_completion(self.exit_on_completion)
    }
}

/// Initialize tracing with PMISERV_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PMISERV_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pmiserv={level},pmiserv_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut version = VersionInfo::new();
    if let Ok(hostname) = pmiserv::kvs::local_hostname() {
        version = version.with_hostname(hostname);
    }
    info!(?version, "pmiserv starting");

    let config = cli.server_config();
    let listener = server::bind(&config).await?;
    let addr = listener.local_addr()?;
    // The launcher reads this line to find the server.
    println!("PMI_PORT={addr}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    server::run(listener, config, shutdown_rx).await?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
