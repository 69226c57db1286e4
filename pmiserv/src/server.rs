//! TCP front end for the rendezvous service.
//!
//! One event loop task exclusively owns the [`PmiService`]. Every accepted
//! connection gets a reader task that decodes frames into [`Event`]s and a
//! writer task fed through an unbounded channel, so the loop never blocks on
//! a slow client.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::info;

use crate::service::{
    ConnId, DEFAULT_PGID, Outbound, PmiService, ServiceConfig, ServiceSnapshot,
};
use crate::wire::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::error::FrameError;
use crate::wire::{Decoded, Frame, PmiCodec, ProtocolVersion, Response};

const EVENT_QUEUE_DEPTH: usize = 1024;

/// How long queued responses get to drain after the loop stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    /// Members of the job's process group.
    pub group_size: usize,
    pub service: ServiceConfig,
    pub max_frame_length: usize,
    /// Stop once every member of the group has finalized or died.
    pub exit_on_completion: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            group_size: 1,
            service: ServiceConfig::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            exit_on_completion: false,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the number of processes in the job.
    pub fn with_group_size(mut self, size: usize) -> Self {
        self.group_size = size;
        self
    }

    /// Set the service configuration.
    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    /// Set the largest accepted command frame.
    pub fn with_max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    /// Stop serving once the job completes.
    pub fn with_exit_on_completion(mut self, exit: bool) -> Self {
        self.exit_on_completion = exit;
        self
    }
}

/// What reader tasks report to the event loop.
#[derive(Debug)]
pub enum Event {
    Frame {
        conn: ConnId,
        frame: Frame,
    },
    /// A frame that could not be decoded. The error reply is queued before
    /// any `Closed` for the same connection.
    Rejected {
        conn: ConnId,
        version: ProtocolVersion,
        error: FrameError,
    },
    Closed {
        conn: ConnId,
    },
}

pub async fn bind(config: &ServerConfig) -> std::io::Result<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port)).await
}

/// Bind, create the job's group and serve until shutdown.
pub async fn serve(config: ServerConfig, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = bind(&config).await?;
    run(listener, config, shutdown_rx).await?;
    Ok(())
}

/// Serve on an already-bound listener. Returns the final service state.
pub async fn run(
    listener: TcpListener,
    config: ServerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<ServiceSnapshot> {
    anyhow::ensure!(config.group_size > 0, "process group needs at least one member");
    let mut service = PmiService::new(config.service.clone());
    service.create_group(DEFAULT_PGID, config.group_size)?;

    info!(
        addr = %listener.local_addr()?,
        size = config.group_size,
        "Rendezvous server listening"
    );

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(EVENT_QUEUE_DEPTH);
    let mut writers: HashMap<ConnId, mpsc::UnboundedSender<Response>> = HashMap::new();
    let mut readers = JoinSet::new();
    let mut writer_tasks = JoinSet::new();
    let mut next_conn = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown_rx) => {
                info!("Shutdown requested");
                break;
            }

            Some(event) = event_rx.recv() => {
                let outbound = match event {
                    Event::Frame { conn, frame } => service.handle_frame(conn, &frame),
                    Event::Rejected { conn, version, error } => {
                        service.reject_frame(conn, version, error)
                    }
                    Event::Closed { conn } => {
                        writers.remove(&conn);
                        service.connection_lost(conn)
                    }
                };
                deliver(&writers, outbound);

                if config.exit_on_completion && service.is_group_complete(DEFAULT_PGID) {
                    info!(pgid = DEFAULT_PGID, "All processes finished");
                    break;
                }
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                }

                let conn = ConnId::new(next_conn);
                next_conn += 1;
                tracing::debug!(%conn, %peer, "Connection accepted");

                let (read_half, write_half) = stream.into_split();
                let codec = PmiCodec::new().with_max_length(config.max_frame_length);
                let reader = FramedRead::new(read_half, codec);
                let writer = FramedWrite::new(write_half, PmiCodec::new());
                let (tx, rx) = mpsc::unbounded_channel();
                writers.insert(conn, tx);

                readers.spawn(reader_task(conn, reader, event_tx.clone()));
                writer_tasks.spawn(writer_task(conn, writer, rx));
            }

            Some(_) = writer_tasks.join_next() => {}
        }
    }

    let snapshot = service.snapshot();
    tracing::debug!(
        state = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "Final rendezvous state"
    );

    // Let writers drain what is already queued; readers are simply dropped.
    writers.clear();
    readers.abort_all();
    let drained = tokio::time::timeout(FLUSH_TIMEOUT, async {
        while writer_tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Timed out flushing responses");
    }

    info!("Server shutdown complete");
    Ok(snapshot)
}

/// Resolves once `true` is sent. A dropped sender never resolves.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn deliver(writers: &HashMap<ConnId, mpsc::UnboundedSender<Response>>, outbound: Vec<Outbound>) {
    for Outbound { conn, response } in outbound {
        let sent = writers.get(&conn).is_some_and(|tx| tx.send(response).is_ok());
        if !sent {
            tracing::debug!(%conn, "Dropping response for closed connection");
        }
    }
}

async fn reader_task(
    conn: ConnId,
    mut reader: FramedRead<OwnedReadHalf, PmiCodec>,
    tx: mpsc::Sender<Event>,
) {
    loop {
        let event = match reader.next().await {
            Some(Ok(Decoded::Frame(frame))) => Event::Frame { conn, frame },
            Some(Ok(Decoded::Skipped { version, error })) => Event::Rejected {
                conn,
                version,
                error,
            },
            // A v2 stream cannot be resynchronized after a bad frame. Tell
            // the peer why before hanging up.
            Some(Err(error)) => {
                tracing::warn!(%conn, %error, "Connection read error");
                let version = reader.decoder().version();
                if let Some(version) = version.filter(|_| !matches!(error, FrameError::Io(_))) {
                    let _ = tx
                        .send(Event::Rejected {
                            conn,
                            version,
                            error,
                        })
                        .await;
                }
                break;
            }
            None => {
                tracing::trace!(%conn, "Connection closed by peer");
                break;
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Event::Closed { conn }).await;
}

async fn writer_task(
    conn: ConnId,
    mut writer: FramedWrite<OwnedWriteHalf, PmiCodec>,
    mut rx: mpsc::UnboundedReceiver<Response>,
) {
    while let Some(response) = rx.recv().await {
        tracing::trace!(%conn, response = %response, "Sending response");
        if let Err(e) = writer.send(response).await {
            tracing::warn!(%conn, error = %e, "Connection write error");
            return;
        }
    }
}
