use std::fmt;

use crate::transport::TransportState;

/// Negotiation and connection lifecycle of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    LocalOfferPending,
    RemoteOfferReceived,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }

    /// The state a transport report moves us to, if it moves us at all.
    /// Terminal states are final and `Connected` is entered once.
    pub fn on_transport(self, reported: TransportState) -> Option<ConnectionState> {
        if self.is_terminal() {
            return None;
        }
        match reported {
            TransportState::Connected if self != ConnectionState::Connected => {
                Some(ConnectionState::Connected)
            }
            TransportState::Disconnected => Some(ConnectionState::Disconnected),
            TransportState::Failed => Some(ConnectionState::Failed),
            TransportState::Closed => Some(ConnectionState::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "NEW",
            ConnectionState::LocalOfferPending => "LOCAL_OFFER_PENDING",
            ConnectionState::RemoteOfferReceived => "REMOTE_OFFER_RECEIVED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
    pub connection: ConnectionState,
    pub channel: ChannelState,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::New,
            channel: ChannelState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::New.is_terminal());
    }

    #[test]
    fn connected_is_entered_once() {
        let state = ConnectionState::Connecting;
        assert_eq!(
            state.on_transport(TransportState::Connected),
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            ConnectionState::Connected.on_transport(TransportState::Connected),
            None
        );
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            ConnectionState::Disconnected,
            ConnectionState::Failed,
            ConnectionState::Closed,
        ] {
            assert_eq!(terminal.on_transport(TransportState::Connected), None);
            assert_eq!(terminal.on_transport(TransportState::Failed), None);
        }
    }

    #[test]
    fn failure_reported_mid_negotiation() {
        assert_eq!(
            ConnectionState::LocalOfferPending.on_transport(TransportState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(
            ConnectionState::Connecting.on_transport(TransportState::Connecting),
            None
        );
    }

    #[test]
    fn display_uses_upper_snake_case() {
        assert_eq!(
            ConnectionState::RemoteOfferReceived.to_string(),
            "REMOTE_OFFER_RECEIVED"
        );
    }
}
