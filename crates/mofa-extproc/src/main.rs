//! MoFA external processor: entry point.
//!
//! Loads configuration, starts the rate-limit dispatcher and serves the
//! `ext_proc` gRPC stream until Ctrl-C.
//!
//! # Configuration
//!
//! | Source | Example |
//! |--------|---------|
//! | `--config <file>` / `MOFA_EXTPROC_CONFIG` | `extproc.toml` |
//! | `MOFA_EXTPROC_<KEY>` | `MOFA_EXTPROC_LISTEN_ADDR=0.0.0.0:9000` |
//! | nested keys use `__` | `MOFA_EXTPROC_RATE_LIMITER__ENDPOINT=http://rls:8081` |
//! | `RUST_LOG` | overrides `log.filter` |

use clap::Parser;
use mofa_extproc::config::LogConfig;
use mofa_extproc::grpc::{self, GrpcRateLimitClient};
use mofa_extproc::ratelimit::{LoggingRateLimitClient, RateLimitClient, RateLimitDispatcher};
use mofa_extproc::{ExtProcConfig, ExtProcResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mofa-extproc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "MOFA_EXTPROC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ExtProcConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mofa-extproc: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(&config.log);

    if let Err(e) = run(config).await {
        error!(error = %e, "MoFA external processor failed");
        std::process::exit(1);
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    if log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(config: ExtProcConfig) -> ExtProcResult<()> {
    let limiter = &config.rate_limiter;
    let client: Arc<dyn RateLimitClient> = match &limiter.endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, domain = %limiter.domain, "using gRPC rate-limit service");
            Arc::new(GrpcRateLimitClient::new(
                endpoint.clone(),
                limiter.domain.clone(),
                Duration::from_millis(limiter.connect_timeout_ms),
            )?)
        }
        None => {
            warn!("rate_limiter.endpoint is not set, accounting batches will only be logged");
            Arc::new(LoggingRateLimitClient::new())
        }
    };

    info!(
        workers = config.dispatcher.workers,
        queue_capacity = config.dispatcher.queue_capacity,
        max_decoded_bytes = config.decoder.max_decoded_bytes,
        "configuration loaded"
    );

    let dispatcher = RateLimitDispatcher::spawn(client, config.dispatcher.clone());
    grpc::serve(&config, dispatcher, grpc::shutdown_signal()).await
}
