//! Batches received packets by count or by a periodic flush timer, whichever
//! comes first, so the chunk processor isn't woken for every single packet.

use super::ReceivedFact;
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn run(
    mut rx: mpsc::Receiver<ReceivedFact>,
    tx: mpsc::Sender<Vec<ReceivedFact>>,
    max_chunk: usize,
    period: Duration,
) {
    let mut buf = Vec::with_capacity(max_chunk);
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // prime the downstream stages with an empty chunk so a cold-started node
    // broadcasts its own facts and runs a reconcile cycle before any peer
    // has sent it anything.
    if tx.send(Vec::new()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            biased;

            item = rx.recv() => {
                match item {
                    Some(item) => {
                        buf.push(item);
                        if buf.len() >= max_chunk && tx.send(std::mem::take(&mut buf)).await.is_err() {
                            return;
                        }
                    },
                    None => {
                        if !buf.is_empty() {
                            let _ = tx.send(buf).await;
                        }
                        return;
                    },
                }
            }
            _ = tick.tick() => {
                if !buf.is_empty() && tx.send(std::mem::take(&mut buf)).await.is_err() {
                    return;
                }
            }
        }
    }
}
