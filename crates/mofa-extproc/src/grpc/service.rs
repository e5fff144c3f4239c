//! `envoy.service.ext_proc.v3.ExternalProcessor` implementation.

use super::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessor;
use super::envoy::service::ext_proc::v3::{ProcessingRequest, ProcessingResponse};
use crate::decoder::BodyDecoder;
use crate::event::ProcessingEvent;
use crate::ratelimit::RateLimitDispatcher;
use crate::session::EventDispatcher;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

/// Replies buffered per stream before the handler waits on the proxy.
const REPLY_BUFFER: usize = 16;

type ReplyStream = Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

/// Accepts processing streams and runs one [`EventDispatcher`] per stream.
pub struct ExtProcService {
    decoder: BodyDecoder,
    dispatcher: RateLimitDispatcher,
    next_stream_id: AtomicU64,
}

impl ExtProcService {
    pub fn new(decoder: BodyDecoder, dispatcher: RateLimitDispatcher) -> Self {
        Self {
            decoder,
            dispatcher,
            next_stream_id: AtomicU64::new(1),
        }
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream = ReplyStream;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        debug!(stream_id, remote = ?request.remote_addr(), "processing stream opened");

        let inbound = request
            .into_inner()
            .map(|item| item.and_then(ProcessingEvent::try_from))
            .boxed();
        let (tx, rx) = mpsc::channel(REPLY_BUFFER);
        let handler = EventDispatcher::new(stream_id, self.decoder.clone(), self.dispatcher.clone());

        tokio::spawn(async move {
            let outcome = handler.serve_stream(inbound, tx).await;
            debug!(stream_id, outcome = ?outcome, "processing stream finished");
        });

        let outbound = ReceiverStream::new(rx).map(|reply| Ok(ProcessingResponse::from(reply)));
        Ok(Response::new(Box::pin(outbound)))
    }
}
