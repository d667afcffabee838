//! WebSocket event hub.
//!
//! Each socket becomes one EventDistributor connection, named after the
//! `nodeId` of the first event it sends. The coordination bridge forwards
//! processed events to the durable core and polls it for state updates.

use futures_util::{SinkExt, StreamExt};
use koord_core::bridge::{spawn_forwarder, spawn_poller};
use koord_core::store::{FileStoreConfig, SharedStore};
use koord_core::{
    ClusterDirectory, ConsensusEvent, CoordConfig, CoordinationBridge, EventDistributor,
    FileStore, MemoryChannel, MemoryStore, SharedDistributor,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Interval between status lines
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(
    config: CoordConfig,
    listen: SocketAddr,
    data_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let distributor = EventDistributor::new(ClusterDirectory::new().shared()).shared();
    let store: SharedStore = match data_dir {
        Some(dir) => Arc::new(FileStore::open(FileStoreConfig::new(dir))?),
        None => Arc::new(MemoryStore::new()),
    };

    let bridge = CoordinationBridge::new(
        distributor.clone(),
        Arc::new(MemoryChannel::new()),
        config.bridge.clone(),
    )
    .shared();
    bridge.connect_core(store);
    let forwarder = spawn_forwarder(&bridge);
    let poller = spawn_poller(&bridge);

    let listener = TcpListener::bind(listen).await?;
    info!("Hub listening on {}", listener.local_addr()?);

    let mut status_ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve(distributor.clone(), stream, peer));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
            _ = status_ticker.tick() => {
                match serde_json::to_string(&bridge.status()) {
                    Ok(status) => info!("Status: {}", status),
                    Err(e) => warn!("Status unavailable: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    forwarder.abort();
    poller.abort();
    Ok(())
}

async fn serve(distributor: SharedDistributor, stream: TcpStream, peer: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };
    debug!("WebSocket connected from {}", peer);

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ConsensusEvent>();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unencodable event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut node_id: Option<String> = None;
    let connection = tx.clone();
    let mut pending = Some(tx);
    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error from {}: {}", peer, e);
                break;
            }
        };

        if node_id.is_none() {
            match ConsensusEvent::from_json(&text) {
                Ok(event) => {
                    if let Some(tx) = pending.take() {
                        info!("Node {} attached from {}", event.node_id, peer);
                        distributor.connect(event.node_id.clone(), tx);
                    }
                    node_id = Some(event.node_id.clone());
                    distributor.handle_event(event);
                }
                Err(e) => warn!("Ignoring malformed first event from {}: {}", peer, e),
            }
            continue;
        }

        let _ = distributor.handle_raw(&text);
    }

    if let Some(id) = node_id {
        if distributor.disconnect_connection(&id, &connection) {
            info!("Node {} detached", id);
        } else {
            debug!("Node {} already reattached elsewhere", id);
        }
    }
    writer.abort();
}
