use super::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessorServer;
use super::service::ExtProcService;
use crate::config::ExtProcConfig;
use crate::decoder::BodyDecoder;
use crate::error::ExtProcResult;
use crate::ratelimit::RateLimitDispatcher;
use std::future::Future;
use tonic::transport::Server;
use tracing::{info, warn};

/// Bind `config.listen_addr` and serve processing streams until `shutdown`
/// resolves.
pub async fn serve(
    config: &ExtProcConfig,
    dispatcher: RateLimitDispatcher,
    shutdown: impl Future<Output = ()>,
) -> ExtProcResult<()> {
    let addr = config.socket_addr()?;
    let service = ExtProcService::new(
        BodyDecoder::new(config.decoder.max_decoded_bytes),
        dispatcher.clone(),
    );

    info!(addr = %addr, "MoFA external processor listening");
    Server::builder()
        .add_service(ExternalProcessorServer::new(service))
        .serve_with_shutdown(addr, shutdown)
        .await?;

    let stats = dispatcher.stats();
    info!(
        submitted = stats.submitted(),
        rejected = stats.rejected(),
        completed = stats.completed(),
        failed = stats.failed(),
        "MoFA external processor stopped"
    );
    Ok(())
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
