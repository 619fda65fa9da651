//! The four-stage concurrent fact pipeline: a socket reader, a chunker that
//! batches received packets, a chunk processor that authenticates and
//! trust-filters them into a merged fact set, and a broadcaster that gossips
//! that set back out. The reconciler consumes the same merged set outside
//! this module.
//!
//! Stages are connected by bounded channels. Per-item errors (a malformed
//! packet, a tag that fails to verify, a fact rejected by trust) are logged
//! and dropped by the stage that hits them; only [`crate::error::StageError::HardIo`]
//! tears the whole pipeline down.

mod broadcaster;
mod chunk_processor;
mod chunker;
mod reader;

pub use broadcaster::{should_send_to, SendLevel};
pub use chunk_processor::peer_by_auto_address;

use crate::{
    error::StageError,
    fact::Fact,
    peer_knowledge::PeerKnowledgeTable,
    signing::Signer,
    trust::Level,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::{Duration, SystemTime}};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use wireguard_control::{Key, PeerInfo};

/// Max packets folded into one chunk before the chunker flushes early.
pub const MAX_CHUNK: usize = 100;
/// Max time the chunker waits before flushing a partial chunk.
pub const CHUNK_PERIOD: Duration = Duration::from_secs(5);
/// How often this node asserts its own `Alive` fact to its peers.
pub const ALIVE_PERIOD: Duration = Duration::from_secs(30);
/// How stale a peer's belief about a fact must be before we resend it.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(6);

pub struct ReceivedFact {
    pub fact: Fact,
    pub source: SocketAddr,
}

/// Everything the pipeline needs to run that isn't fixed at compile time.
pub struct PipelineConfig {
    pub socket: Arc<UdpSocket>,
    pub signer: Arc<Signer>,
    pub local_key: Key,
    pub local_port: u16,
    /// Generated once at process startup; identifies this boot to peers via
    /// the `Alive` fact without minting a new value every broadcast cycle.
    pub boot_id: uuid::Uuid,
    pub peer_knowledge: Arc<PeerKnowledgeTable>,
    pub trust_config: Arc<HashMap<Key, Level>>,
    pub fact_exchangers: Arc<HashMap<Key, bool>>,
    pub chatty: bool,
    pub peers: Arc<dyn Fn() -> Vec<PeerInfo> + Send + Sync>,
    /// Collects this node's own self-asserted facts fresh each broadcast
    /// cycle (interface addresses, mirrored peer config, ...).
    pub local_facts: Arc<dyn Fn() -> Vec<Fact> + Send + Sync>,
}

/// Handles for a running pipeline: the reconciler's input stream and the
/// means to shut the whole thing down. The broadcaster runs entirely
/// internally; nothing outside this module needs to drive it.
pub struct PipelineHandles {
    pub for_reconcile: mpsc::Receiver<Vec<Fact>>,
    pub stopped: oneshot::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandles {
    /// Signals every stage to stop and waits for them to drain.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

pub fn spawn(config: PipelineConfig) -> PipelineHandles {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stopped_tx, stopped) = oneshot::channel();

    let (raw_tx, raw_rx) = mpsc::channel(MAX_CHUNK);
    let (chunk_tx, chunk_rx) = mpsc::channel(4);
    let (merged_tx, merged_rx) = mpsc::channel(1);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(1);
    let (reconcile_tx, for_reconcile) = mpsc::channel(1);

    let mut tasks = Vec::new();

    let reader_socket = config.socket.clone();
    let reader_shutdown = shutdown_rx.clone();
    let stopped_from_reader = stopped_tx;
    tasks.push(tokio::spawn(async move {
        let result = reader::run(reader_socket, raw_tx, reader_shutdown).await;
        let ok = !matches!(result, Err(StageError::HardIo(_)));
        if let Err(e) = result {
            log::error!("pipeline reader stopped: {e}");
        }
        let _ = stopped_from_reader.send(ok);
    }));

    tasks.push(tokio::spawn(async move {
        chunker::run(raw_rx, chunk_tx, MAX_CHUNK, CHUNK_PERIOD).await;
    }));

    let local_key = config.local_key.clone();
    let peer_knowledge = config.peer_knowledge.clone();
    let trust_config = config.trust_config.clone();
    let peers = config.peers.clone();
    let signer = config.signer.clone();
    tasks.push(tokio::spawn(async move {
        chunk_processor::run(
            chunk_rx,
            merged_tx,
            peers,
            trust_config,
            peer_knowledge,
            signer,
            local_key,
        )
        .await;
    }));

    tasks.push(tokio::spawn(async move {
        multiplex(merged_rx, vec![broadcast_tx, reconcile_tx]).await;
    }));

    let broadcast_socket = config.socket;
    let broadcast_signer = config.signer;
    let broadcast_local_key = config.local_key;
    let broadcast_peer_knowledge = config.peer_knowledge;
    let broadcast_trust_config = config.trust_config;
    let broadcast_fact_exchangers = config.fact_exchangers;
    let broadcast_peers = config.peers;
    let local_facts = config.local_facts;
    let local_port = config.local_port;
    let boot_id = config.boot_id;
    let chatty = config.chatty;
    tasks.push(tokio::spawn(async move {
        run_broadcaster(
            broadcast_rx,
            broadcast_socket,
            broadcast_local_key,
            local_port,
            boot_id,
            broadcast_peers,
            local_facts,
            broadcast_trust_config,
            broadcast_fact_exchangers,
            chatty,
            broadcast_signer,
            broadcast_peer_knowledge,
        )
        .await;
    }));

    PipelineHandles {
        for_reconcile,
        stopped,
        shutdown: shutdown_tx,
        tasks,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_broadcaster(
    mut rx: mpsc::Receiver<Vec<Fact>>,
    socket: Arc<UdpSocket>,
    local_key: Key,
    local_port: u16,
    boot_id: uuid::Uuid,
    peers: Arc<dyn Fn() -> Vec<PeerInfo> + Send + Sync>,
    local_facts: Arc<dyn Fn() -> Vec<Fact> + Send + Sync>,
    trust_config: Arc<HashMap<Key, Level>>,
    fact_exchangers: Arc<HashMap<Key, bool>>,
    chatty: bool,
    signer: Arc<Signer>,
    peer_knowledge: Arc<PeerKnowledgeTable>,
) {
    while let Some(remote_facts) = rx.recv().await {
        let now = SystemTime::now();
        let current_peers = peers();
        let facts = broadcaster::facts_to_send(local_facts(), &remote_facts);
        broadcaster::broadcast_once(
            &socket,
            &local_key,
            local_port,
            boot_id,
            &current_peers,
            &facts,
            &trust_config,
            &fact_exchangers,
            chatty,
            &signer,
            &peer_knowledge,
            now,
        )
        .await;
    }
}

/// Forwards every value from `input` to each of `outputs`. Only useful while
/// the outputs are buffered enough that one slow consumer doesn't stall the
/// others for long.
async fn multiplex(mut input: mpsc::Receiver<Vec<Fact>>, outputs: Vec<mpsc::Sender<Vec<Fact>>>) {
    while let Some(chunk) = input.recv().await {
        for output in &outputs {
            if output.send(chunk.clone()).await.is_err() {
                return;
            }
        }
    }
}
