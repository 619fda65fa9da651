//! Reads raw UDP datagrams off the wirelink socket and hands back whatever
//! decodes as a [`Fact`]. Decoding is cheap enough to do inline here rather
//! than pushing raw bytes downstream: a malformed packet is dropped before
//! it ever occupies a slot in the chunker's channel.

use super::ReceivedFact;
use crate::{error::StageError, fact::Fact};
use std::{sync::Arc, time::SystemTime};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
};

const MAX_PACKET: usize = 2048;

/// Runs until `shutdown` is set or the socket hands back an error that isn't
/// transient. Returns `Ok(())` on a clean stop, `Err(StageError::HardIo)` if
/// the socket itself is no longer usable.
pub async fn run(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<ReceivedFact>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), StageError> {
    let mut buf = [0u8; MAX_PACKET];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, source) = match received {
                    Ok(v) => v,
                    Err(e) if is_transient(&e) => {
                        log::warn!("transient error reading packet: {e}");
                        continue;
                    },
                    Err(e) => return Err(StageError::HardIo(e)),
                };
                match Fact::decode(&buf[..n], SystemTime::now()) {
                    Ok(fact) => {
                        if tx.send(ReceivedFact { fact, source }).await.is_err() {
                            // chunker went away: pipeline is shutting down.
                            return Ok(());
                        }
                    },
                    Err(e) => log::debug!("dropping malformed packet from {source}: {e}"),
                }
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted | std::io::ErrorKind::ConnectionRefused
    )
}
