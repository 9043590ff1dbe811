// Peer-facing connection handling
//
// Inbound links must open with a signed `server_hello` that verifies
// against the registered key for the claimed address. After the
// handshake, inbound and outbound links share one reader loop:
// directory gossip updates the peer record, chat traffic fans out to
// local clients and is never re-forwarded.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError};
use crate::envelope::{self, EnvelopeError, Frame, Payload, SignedFrame};
use crate::registry::RegistryError;
use crate::relay::{LinkState, Relay, RemoteClient};
use crate::transport::{self, HANDSHAKE_TIMEOUT_SECS};

#[derive(Debug, Error)]
pub(crate) enum PeerFrameError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("first frame must be a signed server_hello")]
    NotServerHello,
    #[error("no registered key for peer '{0}'")]
    MissingKey(String),
}

pub(crate) async fn handle_inbound(relay: Arc<Relay>, stream: TcpStream) {
    let deadline = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
    let ws = match tokio::time::timeout(deadline, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("peer websocket handshake failed: {e}");
            return;
        }
        Err(_) => return,
    };
    let (sink, mut reader) = ws.split();
    let tx = transport::spawn_writer(sink);

    let Some(hello_text) = transport::read_text_deadline(&mut reader, deadline).await else {
        debug!("peer closed before server_hello");
        return;
    };
    relay.log_frame("recv peer", &hello_text);

    let (address, link_id) = match accept_server_hello(&relay, &hello_text, &tx) {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("peer handshake rejected: {e}");
            return;
        }
    };
    info!(peer = %address, "peer connected (inbound)");

    // Resync the directory with the freshly connected neighbour.
    match envelope::seal(
        &Payload::ClientUpdateRequest,
        relay.next_counter(),
        relay.identity().private_key(),
    ) {
        Ok(request) => {
            transport::try_queue(&tx, request);
        }
        Err(e) => warn!("failed to build client_update_request: {e}"),
    }

    run_link(relay, address, link_id, reader).await;
}

/// Validate an inbound `server_hello` and install the link.
fn accept_server_hello(
    relay: &Relay,
    hello_text: &str,
    tx: &transport::FrameTx,
) -> Result<(String, u64), PeerFrameError> {
    let Frame::Signed(signed) = envelope::parse_frame(hello_text)? else {
        return Err(PeerFrameError::NotServerHello);
    };
    let Payload::ServerHello { sender } = envelope::peek(&signed)? else {
        return Err(PeerFrameError::NotServerHello);
    };

    let key_pem = relay
        .neighbourhood()
        .load_key(&sender)?
        .ok_or_else(|| PeerFrameError::MissingKey(sender.clone()))?;
    let key = crypto::public_key_from_pem(&key_pem)?;
    envelope::open(&signed, &key, 0)?;

    let link_id = relay.register_peer_link(
        &sender,
        tx.clone(),
        Some(key_pem),
        LinkState::Connected,
        signed.counter,
    );
    Ok((sender, link_id))
}

/// Shared reader loop for a peer link, inbound or outbound.
pub(crate) async fn run_link<S>(relay: Arc<Relay>, address: String, link_id: u64, mut reader: S)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(text) = transport::read_text(&mut reader).await {
        relay.log_frame("recv peer", &text);
        if let Err(e) = handle_peer_frame(&relay, &address, &text) {
            debug!(peer = %address, "dropping peer frame: {e}");
        }
    }
    relay.clear_peer_link(&address, link_id);
    info!(peer = %address, "peer link closed");
}

/// Dispatch one frame arriving over a peer link.
pub(crate) fn handle_peer_frame(
    relay: &Relay,
    address: &str,
    text: &str,
) -> Result<(), PeerFrameError> {
    match envelope::parse_frame(text)? {
        Frame::ClientUpdate(update) => {
            let clients: Vec<RemoteClient> = update
                .clients
                .iter()
                .filter_map(|pem| match crypto::public_key_from_pem(pem) {
                    Ok(_) => Some(RemoteClient {
                        fingerprint: crypto::fingerprint(pem),
                        public_key_pem: pem.clone(),
                    }),
                    Err(e) => {
                        warn!(peer = %address, "skipping bad client key in update: {e}");
                        None
                    }
                })
                .collect();
            let count = clients.len();
            // Full atomic replacement of the peer's last-seen list.
            if let Some(peer) = relay.state.lock().peers.get_mut(address) {
                peer.clients = clients;
            }
            debug!(peer = %address, clients = count, "directory updated");
        }
        Frame::ClientList(_) => {
            debug!(peer = %address, "client_list from peer dropped");
        }
        Frame::Signed(signed) => match envelope::peek(&signed)? {
            // Chat traffic is authenticated end-to-end by the original
            // client signature; recipients verify, the relay fans out.
            Payload::Chat { .. } | Payload::PublicChat { .. } => {
                relay.fan_out_local(text, None);
            }
            Payload::ClientUpdateRequest => {
                verify_from_peer(relay, address, &signed)?;
                let pems = relay.state.lock().local_client_pems();
                let reply = envelope::client_update_frame(&pems);
                let tx = relay
                    .state
                    .lock()
                    .peers
                    .get(address)
                    .and_then(|p| p.tx.clone());
                if let Some(tx) = tx {
                    relay.log_frame("send peer", &reply);
                    transport::try_queue(&tx, reply);
                }
            }
            Payload::ServerHello { sender } => {
                if sender == address {
                    verify_from_peer(relay, address, &signed)?;
                    debug!(peer = %address, "repeated server_hello accepted");
                } else {
                    warn!(peer = %address, claimed = %sender, "server_hello address mismatch");
                }
            }
            Payload::Hello { .. } | Payload::ClientListRequest => {
                debug!(peer = %address, "client-only payload from peer dropped");
            }
        },
    }
    Ok(())
}

/// Authenticate a signed frame against the peer's registered key and
/// per-link counter.
fn verify_from_peer(
    relay: &Relay,
    address: &str,
    signed: &SignedFrame,
) -> Result<(), PeerFrameError> {
    let (key_pem, last_counter) = {
        let st = relay.state.lock();
        let Some(peer) = st.peers.get(address) else {
            return Err(PeerFrameError::MissingKey(address.to_string()));
        };
        (peer.public_key_pem.clone(), peer.last_counter)
    };
    let key_pem = match key_pem {
        Some(pem) => pem,
        // Inbound links cache the key at handshake; fall back to the
        // neighbours directory for anything racing that.
        None => relay
            .neighbourhood()
            .load_key(address)?
            .ok_or_else(|| PeerFrameError::MissingKey(address.to_string()))?,
    };
    let key = crypto::public_key_from_pem(&key_pem)?;
    envelope::open(signed, &key, last_counter)?;
    if let Some(peer) = relay.state.lock().peers.get_mut(address) {
        if signed.counter > peer.last_counter {
            peer.last_counter = signed.counter;
        }
    }
    Ok(())
}
