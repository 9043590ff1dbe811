// Shared relay state — one coarse lock over the client and peer tables
//
// Connection tasks copy what they need under the lock and transmit
// outside it; the only thing done while holding the lock is map access
// and channel clones.

use std::collections::HashMap;

use crate::transport::FrameTx;

/// Peer link lifecycle. Owned by the reconnect task for outbound links
/// and by the accept path for inbound ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// A locally connected client.
pub struct LocalClient {
    pub public_key_pem: String,
    /// Last accepted envelope counter.
    pub counter: u64,
    pub tx: FrameTx,
}

/// A client homed on a neighbour, as last gossipped.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    pub fingerprint: String,
    pub public_key_pem: String,
}

/// Per-neighbour record. One exists for every configured address for the
/// process lifetime; only the connection fields change.
#[derive(Default)]
pub struct PeerLink {
    pub state: LinkState,
    /// Identifies the live connection so a stale reader cannot clear a
    /// newer link's state.
    pub link_id: u64,
    pub tx: Option<FrameTx>,
    /// Registered public key, cached from the neighbours directory.
    pub public_key_pem: Option<String>,
    /// Last accepted signed counter on this link.
    pub last_counter: u64,
    /// Last-seen client list, replaced atomically on `client_update`.
    pub clients: Vec<RemoteClient>,
}

#[derive(Default)]
pub struct RelayState {
    /// fingerprint → locally connected client.
    pub clients: HashMap<String, LocalClient>,
    /// address → neighbour link.
    pub peers: HashMap<String, PeerLink>,
}

impl RelayState {
    /// PEMs of every locally connected client.
    pub fn local_client_pems(&self) -> Vec<String> {
        self.clients
            .values()
            .map(|c| c.public_key_pem.clone())
            .collect()
    }

    /// Send handles for local clients, excluding `except` when given.
    pub fn local_targets(&self, except: Option<&str>) -> Vec<(String, FrameTx)> {
        self.clients
            .iter()
            .filter(|(fp, _)| except != Some(fp.as_str()))
            .map(|(fp, c)| (fp.clone(), c.tx.clone()))
            .collect()
    }

    /// Send handles for every Connected peer.
    pub fn peer_targets(&self) -> Vec<(String, FrameTx)> {
        self.peers
            .iter()
            .filter(|(_, p)| p.state == LinkState::Connected)
            .filter_map(|(addr, p)| p.tx.clone().map(|tx| (addr.clone(), tx)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client(tx: FrameTx) -> LocalClient {
        LocalClient {
            public_key_pem: "PEM".into(),
            counter: 0,
            tx,
        }
    }

    #[test]
    fn test_local_targets_exclude_sender() {
        let (tx, _rx) = mpsc::channel(4);
        let mut state = RelayState::default();
        state.clients.insert("alice".into(), client(tx.clone()));
        state.clients.insert("bob".into(), client(tx));

        let targets = state.local_targets(Some("alice"));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "bob");

        assert_eq!(state.local_targets(None).len(), 2);
    }

    #[test]
    fn test_peer_targets_require_connected_state() {
        let (tx, _rx) = mpsc::channel(4);
        let mut state = RelayState::default();
        state.peers.insert(
            "server2:8766".into(),
            PeerLink {
                state: LinkState::Connected,
                tx: Some(tx.clone()),
                ..Default::default()
            },
        );
        state.peers.insert(
            "server3:8766".into(),
            PeerLink {
                state: LinkState::Handshaking,
                tx: Some(tx),
                ..Default::default()
            },
        );
        state.peers.insert("server4:8766".into(), PeerLink::default());

        let targets = state.peer_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "server2:8766");
    }
}
