//! Wirelink: a sidecar daemon that discovers and propagates WireGuard peer
//! configuration across a mesh of trusted peers.
//!
//! [`run`] ties every module together: it opens the device, spawns the fact
//! pipeline, and drives a loop that turns each merged fact snapshot into
//! [`wireguard_control::DeviceUpdate`] calls via [`reconcile::PeerReconciler`].

pub mod autopeer;
pub mod config;
pub mod error;
pub mod fact;
pub mod local_facts;
pub mod net;
pub mod peer_knowledge;
pub mod pipeline;
pub mod reconcile;
pub mod signing;
pub mod trust;

use crate::{
    config::Config,
    error::ConfigError,
    net::IfaceMatcher,
    peer_knowledge::PeerKnowledgeTable,
    pipeline::{PipelineConfig, PipelineHandles},
    reconcile::PeerReconciler,
    signing::Signer,
    trust::Level,
};
use anyhow::{anyhow, Context};
use std::{sync::Arc, time::SystemTime};
use tokio::net::UdpSocket;
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerInfo};

/// `true` iff none of `peers` is itself a router, meaning this node should
/// take on the role. Mirrors the "last one in turns the lights on" autodetect
/// behavior: a mesh with no declared router elects the local node.
fn detect_router(peers: &[PeerInfo]) -> bool {
    !peers.iter().any(trust::is_router)
}

fn current_device(iface: &InterfaceName, backend: Backend) -> std::io::Result<Device> {
    Device::get(iface, backend)
}

/// Brings the interface's mesh-relevant state up to date, then spawns the
/// fact pipeline and runs the reconcile loop until a termination signal
/// arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let backend = Backend::default();
    let device = current_device(&config.iface, backend)
        .with_context(|| format!("failed to read WireGuard device {}", config.iface))?;
    let private_key = device
        .private_key
        .ok_or_else(|| anyhow!("interface {} has no private key configured", config.iface))?;
    let local_key = private_key.get_public();
    let local_port = device
        .listen_port
        .ok_or_else(|| anyhow!("interface {} has no listen port configured", config.iface))?;

    log::info!("wirelink starting on {} as {}", config.iface, local_key.to_base64());

    let is_router = config.router.unwrap_or_else(|| detect_router(&device.peers));
    log::info!("router mode: {}", is_router);

    let boot_id = uuid::Uuid::new_v4();
    let signer = Arc::new(Signer::new(&private_key));
    let peer_knowledge = Arc::new(PeerKnowledgeTable::new());
    let trust_config = Arc::new(config.peers.trust_levels());
    let fact_exchangers = Arc::new(config.peers.fact_exchangers());
    let del_peer_candidates: Vec<Key> = trust_config
        .iter()
        .filter(|(_, level)| **level >= Level::DelPeer)
        .map(|(key, _)| key.clone())
        .collect();

    let report = IfaceMatcher::report(&config.report_ifaces)?;
    let hide = IfaceMatcher::hide(&config.hide_ifaces)?;

    let socket = Arc::new(
        UdpSocket::bind((std::net::Ipv6Addr::UNSPECIFIED, local_port))
            .await
            .with_context(|| format!("failed to bind local fact socket on port {local_port}"))?,
    );

    let peers_iface = config.iface.clone();
    let peers_fn: Arc<dyn Fn() -> Vec<PeerInfo> + Send + Sync> = Arc::new(move || {
        current_device(&peers_iface, backend)
            .map(|d| d.peers)
            .unwrap_or_else(|e| {
                log::warn!("failed to read device peers: {e}");
                Vec::new()
            })
    });

    let facts_iface = config.iface.clone();
    let facts_local_key = local_key.clone();
    let local_facts_fn: Arc<dyn Fn() -> Vec<fact::Fact> + Send + Sync> = Arc::new(move || {
        let peers = current_device(&facts_iface, backend)
            .map(|d| d.peers)
            .unwrap_or_default();
        match local_facts::collect(&facts_local_key, local_port, &peers, &report, &hide, SystemTime::now()) {
            Ok(facts) => facts,
            Err(e) => {
                log::warn!("failed to collect local facts: {e}");
                Vec::new()
            },
        }
    });

    let pipeline_config = PipelineConfig {
        socket,
        signer,
        local_key: local_key.clone(),
        local_port,
        boot_id,
        peer_knowledge: peer_knowledge.clone(),
        trust_config,
        fact_exchangers,
        chatty: config.chatty,
        peers: peers_fn.clone(),
        local_facts: local_facts_fn,
    };

    // resolved once: these are the operator's configured bootstrap
    // endpoints/CIDRs, not something that changes over the process lifetime.
    let seed_facts = reconcile::seed_facts(&config.peers, SystemTime::now());

    let handles = pipeline::spawn(pipeline_config);
    run_reconcile_loop(
        handles,
        peers_fn,
        peer_knowledge,
        local_key,
        config.iface,
        backend,
        is_router,
        del_peer_candidates,
        seed_facts,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_reconcile_loop(
    mut handles: PipelineHandles,
    peers_fn: Arc<dyn Fn() -> Vec<PeerInfo> + Send + Sync>,
    peer_knowledge: Arc<PeerKnowledgeTable>,
    local_key: Key,
    iface: InterfaceName,
    backend: Backend,
    is_router: bool,
    del_peer_candidates: Vec<Key>,
    seed_facts: Vec<fact::Fact>,
) -> anyhow::Result<()> {
    let mut reconciler = PeerReconciler::new();
    let mut shutdown = shutdown_signal();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                log::info!("received shutdown signal, stopping pipeline");
                handles.shutdown().await;
                return Ok(());
            }
            merged = handles.for_reconcile.recv() => {
                let Some(trusted_facts) = merged else {
                    log::warn!("fact pipeline closed unexpectedly");
                    return Err(anyhow!("fact pipeline stopped"));
                };
                let trusted_facts = fact::merge_list(seed_facts.iter().cloned().chain(trusted_facts));
                let peers = peers_fn();
                let outcome = reconciler.reconcile(
                    Some(&local_key),
                    &peers,
                    &trusted_facts,
                    &peer_knowledge,
                    is_router,
                    &del_peer_candidates,
                    SystemTime::now(),
                );
                apply_outcome(&iface, backend, outcome);
            }
        }
    }
}

fn apply_outcome(iface: &InterfaceName, backend: Backend, outcome: reconcile::ReconcileOutcome) {
    if outcome.updates.is_empty() && outcome.removals.is_empty() {
        return;
    }

    let mut update = DeviceUpdate::new();
    for builder in outcome.updates {
        update = update.add_peer(builder);
    }
    for key in &outcome.removals {
        update = update.remove_peer_by_key(key);
    }

    if let Err(e) = update.apply(iface, backend) {
        log::error!("failed to apply WireGuard configuration update: {e}");
    }
}

#[cfg(unix)]
fn shutdown_signal() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                return;
            },
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        let _ = tx.send(());
    });
    rx
}

#[cfg(not(unix))]
fn shutdown_signal() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(());
    });
    rx
}

pub use config::Cli;

/// Parses CLI flags and loads the config file, failing fast on anything that
/// would make `run` unable to start.
pub fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    Config::load(cli)
}
