//! The anti-entropy engine.
//!
//! Push-style pairwise reconciliation: each tick the client picks a random
//! peer and offers its blob inventory; the peer answers with the hashes it
//! lacks and the client streams those blobs over. Blob convergence is
//! commutative (content-addressed, immutable), so concurrent sessions need
//! no ordering. Network faults abandon the tick; the next one retries with
//! a freshly chosen peer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use fluid_core::blob::Blob;
use fluid_core::blob::store::BlobStore;
use fluid_core::error::{Error, Result};
use fluid_core::signature::{HashAlgorithm, signature};
use futures::{SinkExt, StreamExt};
use minicbor::{CborLen, Encode};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, broadcast};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::blobtree::BlobTree;
use crate::protocol::{BlobFrame, PushAck, PushReply, PushRequest};
use crate::replica::Hosts;

type Frames = Framed<TcpStream, LengthDelimitedCodec>;

fn net_err(err: impl std::fmt::Display) -> Error {
    Error::Network(err.to_string())
}

async fn send_message<T: Encode<()> + CborLen<()>>(frames: &mut Frames, message: &T) -> Result<()> {
    let bytes = minicbor::to_vec(message).map_err(net_err)?;
    frames.send(Bytes::from(bytes)).await.map_err(net_err)
}

async fn recv_message<T: for<'b> minicbor::Decode<'b, ()>>(frames: &mut Frames) -> Result<T> {
    let frame = frames
        .next()
        .await
        .ok_or_else(|| Error::Network("peer closed the connection".into()))?
        .map_err(net_err)?;
    minicbor::decode(&frame).map_err(net_err)
}

/// Result of one push session, from the initiator's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// The peer reported convergence for this inventory.
    pub synced: bool,
    /// Blobs the peer confirmed storing.
    pub pushed: u64,
}

/// Runs one push session against a peer endpoint.
pub async fn push_once(peer: &str, store: &BlobStore, tree: &BlobTree) -> Result<PushOutcome> {
    let stream = TcpStream::connect(peer).await.map_err(net_err)?;
    let mut frames = Framed::new(stream, LengthDelimitedCodec::new());

    let summary = tree.summary();
    let request = PushRequest {
        count: summary.count,
        size: summary.size,
        hashes: tree.hashes(),
    };
    send_message(&mut frames, &request).await?;

    let reply: PushReply = recv_message(&mut frames).await?;
    if reply.sync {
        debug!(peer, "peer in sync");
        return Ok(PushOutcome {
            synced: true,
            pushed: 0,
        });
    }

    for hash in &reply.missing {
        let blob = store.fetch(hash).await?;
        send_message(
            &mut frames,
            &BlobFrame {
                hash: hash.clone(),
                data: blob.data().to_vec(),
            },
        )
        .await?;
    }
    let ack: PushAck = recv_message(&mut frames).await?;
    Ok(PushOutcome {
        synced: false,
        pushed: ack.received,
    })
}

/// Accept loop of the anti-entropy server. Each connection is one push
/// session handled on its own task. `store` is expected to carry the save
/// observer that folds received blobs into `tree`; the tree itself is only
/// consulted for the fast summary compare.
pub async fn serve(
    listener: TcpListener,
    store: BlobStore,
    tree: Arc<BlobTree>,
    hashing: HashAlgorithm,
    mut stop: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let store = store.clone();
                        let tree = tree.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_push(stream, store, tree, hashing).await {
                                warn!(%peer, "push session failed: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }
        }
    }
    debug!("anti-entropy server stopped");
}

async fn handle_push(
    stream: TcpStream,
    store: BlobStore,
    tree: Arc<BlobTree>,
    hashing: HashAlgorithm,
) -> Result<u64> {
    let mut frames = Framed::new(stream, LengthDelimitedCodec::new());
    let request: PushRequest = recv_message(&mut frames).await?;

    // Fast compare against the local summary; equal count and size is
    // treated as convergence (approximate by design).
    let local = tree.summary();
    if local.count == request.count && local.size == request.size {
        send_message(
            &mut frames,
            &PushReply {
                sync: true,
                missing: Vec::new(),
            },
        )
        .await?;
        return Ok(0);
    }

    let mut missing = Vec::new();
    for hash in &request.hashes {
        if !store.contains(hash).await {
            missing.push(hash.clone());
        }
    }
    send_message(
        &mut frames,
        &PushReply {
            sync: missing.is_empty(),
            missing: missing.clone(),
        },
    )
    .await?;
    if missing.is_empty() {
        return Ok(0);
    }

    let mut received = 0u64;
    for expected in &missing {
        let frame: BlobFrame = recv_message(&mut frames).await?;
        if frame.hash != *expected {
            warn!(got = %frame.hash, want = %expected, "out-of-order blob frame");
        }
        let blob = Blob::from_parts(Bytes::from(frame.data), frame.hash.clone());
        if signature(hashing, blob.data()) != frame.hash {
            warn!(hash = %frame.hash, "rejecting blob with bad signature");
            continue;
        }
        // The store's save observer folds the new blob into the blob tree.
        store.save(&blob).await?;
        received += 1;
    }
    send_message(&mut frames, &PushAck { received }).await?;
    info!(received, "anti-entropy session stored blobs");
    Ok(received)
}

/// The periodic anti-entropy client.
pub async fn run_client(
    store: BlobStore,
    tree: Arc<BlobTree>,
    hosts: Arc<RwLock<Hosts>>,
    local_name: String,
    delay: Duration,
    mut stop: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(delay);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = ticker.tick() => {}
        }
        // Fewer than two hosts: nothing to reconcile with.
        let peer = {
            let hosts = hosts.read().await;
            hosts.random_peer(&local_name, &mut rand::rng()).cloned()
        };
        let Some(peer) = peer else { continue };

        match push_once(&peer.endpoint(), &store, &tree).await {
            Ok(outcome) => {
                let mut hosts = hosts.write().await;
                if let Some(entry) = hosts.get_mut(&peer.name) {
                    entry.sent_blobs += outcome.pushed;
                    entry.last_seen = Some(Utc::now());
                }
                if outcome.pushed > 0 {
                    info!(peer = %peer.name, pushed = outcome.pushed, "pushed blobs to peer");
                } else {
                    debug!(peer = %peer.name, synced = outcome.synced, "nothing to push");
                }
            }
            // Abandon the tick; the next one picks a fresh peer.
            Err(err) => warn!(peer = %peer.name, "anti-entropy tick abandoned: {err}"),
        }
    }
    debug!("anti-entropy client stopped");
}
