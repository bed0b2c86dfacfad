use std::collections::HashMap;

use crate::peer::{ConnectionId, PeerHandle};
use crate::types::PeerId;

/// One direct connection owned by the session
pub(crate) struct PeerSlot {
    pub handle: PeerHandle,
    pub nickname: String,
}

impl PeerSlot {
    pub fn conn(&self) -> ConnectionId {
        self.handle.connection_id()
    }
}

/// Direct connections keyed by remote peer id, at most one per peer
#[derive(Default)]
pub(crate) struct PeerArena {
    slots: HashMap<PeerId, PeerSlot>,
    next_conn: ConnectionId,
}

impl PeerArena {
    /// Fresh generation number for a new connection
    pub fn next_connection_id(&mut self) -> ConnectionId {
        self.next_conn += 1;
        self.next_conn
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerSlot> {
        self.slots.get(peer)
    }

    /// Whether `conn` is the live connection to `peer`
    pub fn is_current(&self, peer: &PeerId, conn: ConnectionId) -> bool {
        self.slots.get(peer).is_some_and(|slot| slot.conn() == conn)
    }

    /// Insert a connection, handing back the one it replaces so the caller
    /// can close it
    pub fn insert(&mut self, peer: PeerId, slot: PeerSlot) -> Option<PeerSlot> {
        self.slots.insert(peer, slot)
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerSlot> {
        self.slots.remove(peer)
    }

    /// Remove only if `conn` is still the live connection
    pub fn remove_current(&mut self, peer: &PeerId, conn: ConnectionId) -> Option<PeerSlot> {
        if self.is_current(peer, conn) {
            self.slots.remove(peer)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerSlot)> {
        self.slots.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (PeerId, PeerSlot)> + '_ {
        self.slots.drain()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn any_connected(&self) -> bool {
        self.slots.values().any(|slot| slot.handle.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{MemoryNetwork, TransportFactory};

    fn slot(net: &MemoryNetwork, arena: &mut PeerArena, remote: PeerId) -> PeerSlot {
        let local = PeerId::try_from("peer_local01").unwrap();
        let (transport, events) = net.factory(local).create(remote).unwrap();
        let (notify, _rx) = mpsc::unbounded_channel();
        let conn = arena.next_connection_id();
        PeerSlot {
            handle: PeerHandle::spawn(remote, conn, transport, events, notify),
            nickname: "Ece".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_replaces_existing_record() {
        let net = MemoryNetwork::new();
        let mut arena = PeerArena::default();
        let peer = PeerId::try_from("peer_rider001").unwrap();

        let first = slot(&net, &mut arena, peer);
        let first_conn = first.conn();
        assert!(arena.insert(peer, first).is_none());

        let second = slot(&net, &mut arena, peer);
        let second_conn = second.conn();
        let replaced = arena.insert(peer, second).unwrap();
        assert_eq!(replaced.conn(), first_conn);
        assert_eq!(arena.len(), 1);

        assert!(!arena.is_current(&peer, first_conn));
        assert!(arena.remove_current(&peer, first_conn).is_none());
        assert!(arena.remove_current(&peer, second_conn).is_some());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn connection_ids_are_unique() {
        let mut arena = PeerArena::default();
        let a = arena.next_connection_id();
        let b = arena.next_connection_id();
        assert_ne!(a, b);
    }
}
