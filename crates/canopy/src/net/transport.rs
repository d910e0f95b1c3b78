use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use super::connection::PeerId;
use super::protocol::{Envelope, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not reachable")]
    UnknownPeer(PeerId),
    #[error("transport closed")]
    Closed,
}

/// Outbound half of the channel the engine talks through. Delivery is assumed
/// ordered per peer; inbound messages are handed to the engine by the owner of
/// the transport.
pub trait Transport {
    fn send_to_authority(&mut self, envelope: &str) -> Result<(), TransportError>;

    fn send_to_client(&mut self, peer: PeerId, envelope: &str) -> Result<(), TransportError>;

    fn send_to_all_clients(&mut self, envelope: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Authority,
    Client(PeerId),
    AllClients,
}

/// Keeps every outgoing envelope; used by tests to assert on traffic.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<(Route, String)>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<(Route, String)> {
        std::mem::take(&mut self.sent)
    }

    pub fn decoded(&self) -> Result<Vec<(Route, Envelope)>, ProtocolError> {
        self.sent
            .iter()
            .map(|(route, text)| Envelope::from_json(text).map(|envelope| (*route, envelope)))
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send_to_authority(&mut self, envelope: &str) -> Result<(), TransportError> {
        self.sent.push((Route::Authority, envelope.to_owned()));
        Ok(())
    }

    fn send_to_client(&mut self, peer: PeerId, envelope: &str) -> Result<(), TransportError> {
        self.sent.push((Route::Client(peer), envelope.to_owned()));
        Ok(())
    }

    fn send_to_all_clients(&mut self, envelope: &str) -> Result<(), TransportError> {
        self.sent.push((Route::AllClients, envelope.to_owned()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: PeerId,
    pub envelope: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HubStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Debug, Default)]
struct HubState {
    inboxes: BTreeMap<PeerId, VecDeque<Delivery>>,
    stats: HubStats,
}

impl HubState {
    fn deliver(&mut self, from: PeerId, to: PeerId, envelope: &str) -> Result<(), TransportError> {
        let Some(inbox) = self.inboxes.get_mut(&to) else {
            self.stats.messages_dropped += 1;
            return Err(TransportError::UnknownPeer(to));
        };
        inbox.push_back(Delivery {
            from,
            envelope: envelope.to_owned(),
        });
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += envelope.len() as u64;
        Ok(())
    }
}

/// In-memory message switch connecting one authority and any number of
/// clients on the same thread.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    state: Rc<RefCell<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an inbox for `peer` and returns its outbound endpoint.
    pub fn endpoint(&self, peer: PeerId) -> LoopbackTransport {
        self.state.borrow_mut().inboxes.entry(peer).or_default();
        LoopbackTransport {
            peer,
            hub: self.clone(),
        }
    }

    /// Closes the inbox of `peer`; pending deliveries are discarded.
    pub fn disconnect(&self, peer: PeerId) {
        self.state.borrow_mut().inboxes.remove(&peer);
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.state.borrow().inboxes.contains_key(&peer)
    }

    pub fn drain(&self, peer: PeerId) -> Vec<Delivery> {
        self.state
            .borrow_mut()
            .inboxes
            .get_mut(&peer)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> usize {
        self.state.borrow().inboxes.values().map(VecDeque::len).sum()
    }

    pub fn stats(&self) -> HubStats {
        self.state.borrow().stats
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    peer: PeerId,
    hub: LoopbackHub,
}

impl LoopbackTransport {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl Transport for LoopbackTransport {
    fn send_to_authority(&mut self, envelope: &str) -> Result<(), TransportError> {
        if !self.hub.is_connected(self.peer) {
            return Err(TransportError::Closed);
        }
        self.hub
            .state
            .borrow_mut()
            .deliver(self.peer, PeerId::AUTHORITY, envelope)
    }

    fn send_to_client(&mut self, peer: PeerId, envelope: &str) -> Result<(), TransportError> {
        self.hub.state.borrow_mut().deliver(self.peer, peer, envelope)
    }

    fn send_to_all_clients(&mut self, envelope: &str) -> Result<(), TransportError> {
        let mut state = self.hub.state.borrow_mut();
        let clients: Vec<PeerId> = state
            .inboxes
            .keys()
            .copied()
            .filter(|&peer| peer != PeerId::AUTHORITY && peer != self.peer)
            .collect();
        for client in clients {
            state.deliver(self.peer, client, envelope)?;
        }
        Ok(())
    }
}
