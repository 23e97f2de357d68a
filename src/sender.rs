// Sender: poll the sampler on an interval, frame each poll and write it to the receiver.
// Write or connect failures drop the connection; the next tick reconnects after a delay.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec;
use crate::models::{GpuInfo, WireMessage};
use crate::sampler::Sampler;

/// Client-side timestamp format: local wall clock with explicit offset.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub server: String,
    pub magic: i64,
    pub interval: Duration,
    pub reconnect_delay: Duration,
}

pub fn build_message(magic: i64, gpu_info: Vec<GpuInfo>) -> WireMessage {
    WireMessage {
        magic,
        timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
        gpu_info,
    }
}

/// Runs until `shutdown` flips to true. Returns the number of frames written.
pub async fn run(
    sampler: Sampler,
    config: SenderConfig,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut conn: Option<TcpStream> = None;
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let gpus = match sampler.poll().await {
            Ok(gpus) => gpus,
            Err(e) => {
                warn!(error = %e, "sampler poll failed");
                continue;
            }
        };
        let frame = match codec::encode(&build_message(config.magic, gpus)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode frame");
                continue;
            }
        };

        if conn.is_none() {
            match TcpStream::connect(&config.server).await {
                Ok(stream) => {
                    info!(server = %config.server, "connected");
                    conn = Some(stream);
                }
                Err(e) => {
                    warn!(server = %config.server, error = %e, "connect failed, retrying");
                    tokio::time::sleep(config.reconnect_delay).await;
                    continue;
                }
            }
        }

        if let Some(stream) = conn.as_mut() {
            match stream.write_all(&frame).await {
                Ok(()) => {
                    sent += 1;
                    debug!(bytes = frame.len(), "frame sent");
                }
                Err(e) => {
                    warn!(error = %e, "write failed, reconnecting");
                    conn = None;
                    tokio::time::sleep(config.reconnect_delay).await;
                }
            }
        }
    }
    info!(sent, "sender stopped");
    sent
}
