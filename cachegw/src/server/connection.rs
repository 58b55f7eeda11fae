// (c) 2025 The cachegw authors

//! Per-connection request loop
//!
//! Reads into a fixed scratch buffer, accumulates until a complete frame
//! parses, dispatches it, and streams the response back. Requests on one
//! connection are strictly serial: the next read does not begin until the
//! previous response has been fully written.
//!
//! A parse failure that more bytes could cure keeps the connection reading;
//! a malformed frame terminates it, and only it: the server and its other
//! connections are unaffected.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::Activity;
use crate::backend::Backend;
use crate::protocol::message::write_protocol_error;
use crate::protocol::serializer::{self, PooledSerializer};
use crate::protocol::{Frame, Request, SetupParams};

/// State for one accepted connection.
pub struct ConnectionHandler<S> {
    id: u64,
    stream: S,
    backend: Arc<dyn Backend>,
    setup: SetupParams,
    buffer_size: usize,
    accumulator: BytesMut,
    serializer: PooledSerializer,
    activity: Arc<Activity>,
    shutdown: CancellationToken,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[allow(clippy::too_many_arguments)] // construction site is the accept loop only
    pub fn new(
        id: u64,
        stream: S,
        backend: Arc<dyn Backend>,
        setup: SetupParams,
        buffer_size: usize,
        activity: Arc<Activity>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            stream,
            backend,
            setup,
            buffer_size,
            accumulator: BytesMut::new(),
            serializer: serializer::acquire(),
            activity,
            shutdown,
        }
    }

    /// Serves the connection until EOF, transport error, malformed input or
    /// shutdown. The pooled serializer is returned on drop.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut scratch = vec![0u8; self.buffer_size];
        debug!("connection {}: serving", self.id);

        loop {
            // Cancellation is only honored between requests; an in-flight
            // response always completes.
            let read = tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("connection {}: shutdown", self.id);
                    return Ok(());
                }
                r = self.stream.read(&mut scratch) => r,
            };
            let n = match read {
                Ok(0) => {
                    debug!("connection {}: closed by peer", self.id);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("connection {}: read failed: {e}", self.id);
                    return Ok(());
                }
            };
            self.accumulator.extend_from_slice(&scratch[..n]);

            let handled = match Frame::parse(&self.accumulator) {
                Err(e) if e.is_incomplete() => {
                    trace!(
                        "connection {}: {} buffered bytes, awaiting more ({e})",
                        self.id,
                        self.accumulator.len()
                    );
                    false
                }
                Err(e) => {
                    warn!("connection {}: malformed frame ({e}), closing", self.id);
                    anyhow::bail!("malformed frame: {e}");
                }
                Ok(frame) => {
                    trace!(
                        "connection {}: frame type {:#06x}, {} fields",
                        self.id,
                        frame.msg_type,
                        frame.fields().len()
                    );
                    match Request::from_frame(&frame) {
                        Ok(request) => {
                            let response_type = request.response_type();
                            let response = request.dispatch(&*self.backend, &self.setup).await;
                            response
                                .write(response_type, &mut self.serializer, &mut self.stream)
                                .await?;
                        }
                        Err(protocol_error) => {
                            warn!("connection {}: {protocol_error}", self.id);
                            write_protocol_error(
                                &protocol_error,
                                frame.msg_type,
                                &mut self.serializer,
                                &mut self.stream,
                            )
                            .await?;
                        }
                    }
                    true
                }
            };

            if handled {
                self.accumulator.clear();
                self.serializer.reset();
                self.activity.touch();
            }
        }
    }
}
