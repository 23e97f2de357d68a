// Accept loop for the ingestion process. One sender connection is served at a time; the next
// queued connection is accepted once the current one closes or errors. Every database write
// (ingest, rollup, retention, scheduled VACUUM) runs on this one task.

use chrono::FixedOffset;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, FrameDecoder};
use crate::config::TransportConfig;
use crate::ingest::Ingestor;
use crate::models::WireMessage;
use crate::retention;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub magic: i64,
    pub naive_offset: FixedOffset,
    pub read_buffer_bytes: usize,
    pub max_frame_bytes: usize,
}

impl ReceiverConfig {
    pub fn from_transport(t: &TransportConfig) -> anyhow::Result<Self> {
        let naive_offset = FixedOffset::east_opt(t.client_utc_offset_hours * 3600)
            .ok_or_else(|| anyhow::anyhow!("invalid UTC offset: {}", t.client_utc_offset_hours))?;
        Ok(Self {
            magic: t.magic,
            naive_offset,
            read_buffer_bytes: t.read_buffer_bytes,
            max_frame_bytes: t.max_frame_bytes,
        })
    }
}

/// Counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub accepted: u64,
    pub rejected: u64,
}

pub struct Receiver {
    ingestor: Ingestor,
    config: ReceiverConfig,
    vacuum_rx: Option<mpsc::Receiver<()>>,
    shutdown: watch::Receiver<bool>,
    stopping: bool,
}

enum ReadEvent {
    Data(usize),
    Closed,
    Shutdown,
}

impl Receiver {
    pub fn new(
        ingestor: Ingestor,
        config: ReceiverConfig,
        vacuum_rx: Option<mpsc::Receiver<()>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ingestor,
            config,
            vacuum_rx,
            shutdown,
            stopping: false,
        }
    }

    /// Serve connections until shutdown is signalled. Returns the ingestor for inspection.
    pub async fn run(mut self, listener: TcpListener) -> anyhow::Result<Ingestor> {
        loop {
            if self.stopping || *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(%peer, "connection accepted");
                            let stats = self.serve_connection(stream).await;
                            info!(%peer, accepted = stats.accepted, rejected = stats.rejected, "connection closed");
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                Some(()) = recv_vacuum(&mut self.vacuum_rx) => {
                    retention::run_scheduled_vacuum(self.ingestor.store()).await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("receiver stopped");
        Ok(self.ingestor)
    }

    /// Read frames from one sender until it disconnects, errors or shutdown is signalled.
    pub async fn serve_connection(&mut self, mut stream: TcpStream) -> ConnectionStats {
        let mut decoder = FrameDecoder::new(self.config.magic, self.config.max_frame_bytes);
        let mut chunk = vec![0u8; self.config.read_buffer_bytes];
        let mut stats = ConnectionStats::default();

        loop {
            let event = tokio::select! {
                read = stream.read(&mut chunk) => match read {
                    Ok(0) => ReadEvent::Closed,
                    Ok(n) => ReadEvent::Data(n),
                    Err(e) => {
                        warn!(error = %e, "read failed");
                        ReadEvent::Closed
                    }
                },
                Some(()) = recv_vacuum(&mut self.vacuum_rx) => {
                    retention::run_scheduled_vacuum(self.ingestor.store()).await;
                    continue;
                }
                _ = self.shutdown.changed() => ReadEvent::Shutdown,
            };

            match event {
                ReadEvent::Data(n) => {
                    decoder.extend(&chunk[..n]);
                    self.drain(&mut decoder, &mut stats).await;
                }
                ReadEvent::Closed => break,
                ReadEvent::Shutdown => {
                    self.stopping = true;
                    break;
                }
            }
        }
        if decoder.buffered() > 0 {
            debug!(bytes = decoder.buffered(), "dropping incomplete frame at disconnect");
        }
        stats
    }

    async fn drain(&mut self, decoder: &mut FrameDecoder, stats: &mut ConnectionStats) {
        loop {
            match decoder.decode() {
                Ok(Some(message)) => {
                    if self.handle_message(message).await {
                        stats.accepted += 1;
                    } else {
                        stats.rejected += 1;
                    }
                }
                Ok(None) => break,
                Err(e @ CodecError::BadMagic { .. }) => {
                    stats.rejected += 1;
                    warn!(error = %e, "invalid data packet discarded");
                }
                Err(e) => {
                    stats.rejected += 1;
                    error!(error = %e, "failed to decode frame");
                }
            }
        }
    }

    async fn handle_message(&mut self, message: WireMessage) -> bool {
        let at = match message.timestamp_utc(self.config.naive_offset) {
            Ok(at) => at,
            Err(e) => {
                warn!(error = %e, "frame with unreadable timestamp discarded");
                return false;
            }
        };
        self.ingestor.ingest(&message.gpu_info, at).await;
        true
    }
}

async fn recv_vacuum(rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
