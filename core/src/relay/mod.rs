// Server relay core — connection intake, routing, and fan-out
//
// Three intake surfaces run concurrently: the client WebSocket listener,
// the peer WebSocket listener, and the HTTP file store. They share one
// coarse mutex over the client/peer tables; all socket I/O happens
// through per-connection bounded writer queues.

mod client_conn;
mod peer_conn;
mod state;

pub use state::{LinkState, LocalClient, PeerLink, RelayState, RemoteClient};

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::envelope;
use crate::files;
use crate::identity::{Identity, IdentityError};
use crate::registry::{self, Neighbourhood};
use crate::transport::{self, FrameTx};

pub(crate) use peer_conn::{handle_peer_frame, run_link};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

pub struct Relay {
    config: ServerConfig,
    identity: Identity,
    /// Canonical `host:port` this server is known by in the neighbourhood.
    address: String,
    neighbourhood: Neighbourhood,
    pub(crate) state: Mutex<RelayState>,
    /// This server's own signing counter (server_hello, client_update_request).
    counter: AtomicU64,
    link_ids: AtomicU64,
}

impl Relay {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, RelayError> {
        let identity = Identity::load_or_generate(
            &config.config_dir,
            "server_private_key.pem",
            "server_public_key.pem",
        )?;
        fs::create_dir_all(&config.neighbours_dir)?;
        fs::create_dir_all(&config.clients_dir)?;
        fs::create_dir_all(&config.files_dir)?;

        let neighbourhood = Neighbourhood::new(&config);
        let address = config.canonical_address();

        // Peer records exist for every configured neighbour up front; only
        // their connection state changes over the process lifetime.
        let mut state = RelayState::default();
        for addr in neighbourhood.addresses() {
            state.peers.insert(addr.clone(), PeerLink::default());
        }

        info!(
            address = %address,
            fingerprint = %identity.fingerprint(),
            neighbours = neighbourhood.addresses().len(),
            "relay initialized"
        );

        Ok(Arc::new(Self {
            config,
            identity,
            address,
            neighbourhood,
            state: Mutex::new(state),
            counter: AtomicU64::new(0),
            link_ids: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn neighbourhood(&self) -> &Neighbourhood {
        &self.neighbourhood
    }

    /// Next value of this server's own monotonic signing counter.
    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_link_id(&self) -> u64 {
        self.link_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Run the three intake surfaces and the neighbour reconnect tasks
    /// until interrupted.
    pub async fn run(self: Arc<Self>) -> Result<(), RelayError> {
        let client_listener =
            TcpListener::bind((self.config.bind_address.as_str(), self.config.client_ws_port))
                .await?;
        let peer_listener =
            TcpListener::bind((self.config.bind_address.as_str(), self.config.server_ws_port))
                .await?;
        info!(
            clients = self.config.client_ws_port,
            peers = self.config.server_ws_port,
            http = self.config.http_port,
            "listening"
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_clients(self.clone(), client_listener)));
        tasks.push(tokio::spawn(accept_peers(self.clone(), peer_listener)));
        tasks.push(tokio::spawn(files::serve(self.clone())));
        for addr in self.neighbourhood.addresses() {
            tasks.push(tokio::spawn(registry::maintain_link(
                self.clone(),
                addr.clone(),
            )));
        }

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        for task in &tasks {
            task.abort();
        }
        // Dropping every send handle closes the writer tasks, which close
        // their sockets.
        let mut st = self.state.lock();
        st.clients.clear();
        for peer in st.peers.values_mut() {
            peer.tx = None;
            peer.state = LinkState::Disconnected;
        }
        Ok(())
    }

    /// IP the warp file server binds to.
    pub(crate) fn bind_ip(&self) -> IpAddr {
        self.config
            .bind_address
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    // ========================================================================
    // FRAME DISTRIBUTION
    // ========================================================================

    pub(crate) fn log_frame(&self, direction: &str, text: &str) {
        if self.config.log_messages {
            info!(%direction, frame = %envelope::sanitize_frame(text), "frame");
        }
    }

    /// Deliver a frame to every local client, excluding `except` when set.
    /// Clients that overflow their send queue are dropped.
    pub(crate) fn fan_out_local(&self, frame: &str, except: Option<&str>) {
        let targets = self.state.lock().local_targets(except);
        let mut overflowed = Vec::new();
        for (fp, tx) in targets {
            if !transport::try_queue(&tx, frame.to_string()) {
                overflowed.push(fp);
            }
        }
        if !overflowed.is_empty() {
            {
                let mut st = self.state.lock();
                for fp in &overflowed {
                    if st.clients.remove(fp).is_some() {
                        warn!(client = %fp, "send queue overflow, dropping client");
                    }
                }
            }
            self.gossip_client_update();
        }
    }

    /// Forward a frame to one peer; false when the peer is not Connected
    /// or its queue overflowed.
    pub(crate) fn forward_to_peer(&self, address: &str, frame: &str) -> bool {
        let handle = {
            let st = self.state.lock();
            st.peers
                .get(address)
                .filter(|p| p.state == LinkState::Connected)
                .and_then(|p| p.tx.clone().map(|tx| (tx, p.link_id)))
        };
        let Some((tx, link_id)) = handle else {
            return false;
        };
        if transport::try_queue(&tx, frame.to_string()) {
            true
        } else {
            warn!(peer = %address, "send queue overflow, dropping peer link");
            self.clear_peer_link(address, link_id);
            false
        }
    }

    /// Forward a frame once to every Connected peer.
    pub(crate) fn broadcast_to_peers(&self, frame: &str) {
        let targets = self.state.lock().peer_targets();
        for (address, tx) in targets {
            if !transport::try_queue(&tx, frame.to_string()) {
                warn!(peer = %address, "send queue overflow, dropping peer link");
                let link_id = self
                    .state
                    .lock()
                    .peers
                    .get(&address)
                    .map(|p| p.link_id)
                    .unwrap_or_default();
                self.clear_peer_link(&address, link_id);
            }
        }
    }

    /// Route a client-originated `chat` frame to its destination servers.
    pub(crate) fn route_chat(&self, frame: &str, destinations: &[String], sender_fp: &str) {
        for dest in destinations {
            if dest == &self.address {
                self.fan_out_local(frame, Some(sender_fp));
            } else if !self.forward_to_peer(dest, frame) {
                warn!(destination = %dest, "no route to destination server, dropping");
            }
        }
    }

    // ========================================================================
    // DIRECTORY GOSSIP
    // ========================================================================

    /// Tell every connected peer which clients are homed here.
    pub(crate) fn gossip_client_update(&self) {
        let (pems, targets) = {
            let st = self.state.lock();
            (st.local_client_pems(), st.peer_targets())
        };
        let frame = envelope::client_update_frame(&pems);
        for (address, tx) in targets {
            if !transport::try_queue(&tx, frame.clone()) {
                debug!(peer = %address, "client_update not queued");
            }
        }
        self.log_frame("gossip", &frame);
    }

    /// Build the `client_list` reply: the local entry first, then one entry
    /// per known neighbour with its last-gossipped clients.
    pub(crate) fn build_client_list(&self) -> String {
        let servers = {
            let st = self.state.lock();
            let mut servers = Vec::with_capacity(1 + st.peers.len());
            servers.push(envelope::ServerEntry {
                address: self.address.clone(),
                server_fingerprint: self.identity.fingerprint().to_string(),
                clients: st.local_client_pems(),
            });
            for (address, peer) in &st.peers {
                servers.push(envelope::ServerEntry {
                    address: address.clone(),
                    server_fingerprint: peer
                        .public_key_pem
                        .as_deref()
                        .map(crate::crypto::fingerprint)
                        .unwrap_or_default(),
                    // A fingerprint connected here is local; a stale gossip
                    // claim from a peer does not override that.
                    clients: peer
                        .clients
                        .iter()
                        .filter(|c| !st.clients.contains_key(&c.fingerprint))
                        .map(|c| c.public_key_pem.clone())
                        .collect(),
                });
            }
            servers
        };
        envelope::client_list_frame(&servers)
    }

    // ========================================================================
    // PEER LINK BOOKKEEPING
    // ========================================================================

    pub(crate) fn set_peer_state(&self, address: &str, state: LinkState) {
        if let Some(peer) = self.state.lock().peers.get_mut(address) {
            peer.state = state;
        }
    }

    /// Install a live link for `address`, replacing any previous one. Each
    /// verified handshake opens a fresh counter scope so a restarted
    /// neighbour is not locked out by its old high-water mark.
    pub(crate) fn register_peer_link(
        &self,
        address: &str,
        tx: FrameTx,
        public_key_pem: Option<String>,
        state: LinkState,
        last_counter: u64,
    ) -> u64 {
        let link_id = self.next_link_id();
        let mut st = self.state.lock();
        let peer = st.peers.entry(address.to_string()).or_default();
        peer.state = state;
        peer.link_id = link_id;
        peer.tx = Some(tx);
        peer.last_counter = last_counter;
        if public_key_pem.is_some() {
            peer.public_key_pem = public_key_pem;
        }
        link_id
    }

    /// Tear down a link, but only if it is still the current one.
    pub(crate) fn clear_peer_link(&self, address: &str, link_id: u64) {
        let mut st = self.state.lock();
        if let Some(peer) = st.peers.get_mut(address) {
            if peer.link_id == link_id {
                peer.state = LinkState::Disconnected;
                peer.tx = None;
            }
        }
    }

    /// Persist a client's public key under `<clients>/<fingerprint>.pem`.
    /// Base64 fingerprints are made filename-safe ('/' → '_', '+' → '-').
    pub(crate) fn persist_client_key(&self, fingerprint: &str, pem: &str) {
        let name = format!("{}.pem", fingerprint.replace('/', "_").replace('+', "-"));
        let path = self.config.clients_dir.join(name);
        if let Err(e) = fs::write(&path, pem) {
            warn!(path = %path.display(), "failed to persist client key: {e}");
        }
    }
}

async fn accept_clients(relay: Arc<Relay>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "client connection accepted");
                tokio::spawn(client_conn::handle(relay.clone(), stream));
            }
            Err(e) => {
                warn!("client accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_peers(relay: Arc<Relay>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "peer connection accepted");
                tokio::spawn(peer_conn::handle_inbound(relay.clone(), stream));
            }
            Err(e) => {
                warn!("peer accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
