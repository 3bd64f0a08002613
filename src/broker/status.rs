//! Broker status values and transition rules (pure logic).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::TransportEvent;

/// Lifecycle status of one broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    /// Connection attempt in flight; channel operations queue until ready
    Connecting,
    /// Handshake complete; publishes are accepted
    Connected,
    /// Peer signalled ACCESS_REFUSED; the broker is being taken down
    Stopping,
    /// Connection lost; the transport is retrying on its own timer
    Disconnected,
    /// Closed at our request; terminal
    Closed,
    /// Unrecoverable failure or abnormal close
    Failed,
}

impl BrokerStatus {
    /// Usable brokers accept subscriptions and declarations
    pub fn usable(&self) -> bool {
        matches!(self, BrokerStatus::Connecting | BrokerStatus::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerStatus::Connecting => "connecting",
            BrokerStatus::Connected => "connected",
            BrokerStatus::Stopping => "stopping",
            BrokerStatus::Disconnected => "disconnected",
            BrokerStatus::Closed => "closed",
            BrokerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a transition from `from` to `to` may be applied.
///
/// `closed` never regresses; a failed close stays failed. Re-entering the
/// same state is rejected here so callers fire their status callback
/// exactly once per distinct transition.
pub fn transition_allowed(from: BrokerStatus, to: BrokerStatus) -> bool {
    if from == to {
        return false;
    }
    match from {
        BrokerStatus::Closed => false,
        BrokerStatus::Failed => to != BrokerStatus::Closed,
        _ => true,
    }
}

/// Status implied by a transport event.
///
/// The preliminary `connected` notification maps to nothing: `connected` is
/// reached only on `ready`, after the handshake.
pub fn status_for_event(event: TransportEvent) -> Option<BrokerStatus> {
    match event {
        TransportEvent::Connected => None,
        TransportEvent::Ready => Some(BrokerStatus::Connected),
        TransportEvent::Disconnected => Some(BrokerStatus::Disconnected),
        TransportEvent::Failed => Some(BrokerStatus::Failed),
        TransportEvent::Closed => Some(BrokerStatus::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_states() {
        assert!(BrokerStatus::Connecting.usable());
        assert!(BrokerStatus::Connected.usable());
        assert!(!BrokerStatus::Stopping.usable());
        assert!(!BrokerStatus::Disconnected.usable());
        assert!(!BrokerStatus::Closed.usable());
        assert!(!BrokerStatus::Failed.usable());
    }

    #[test]
    fn test_closed_never_regresses() {
        for to in [
            BrokerStatus::Connecting,
            BrokerStatus::Connected,
            BrokerStatus::Stopping,
            BrokerStatus::Disconnected,
            BrokerStatus::Failed,
        ] {
            assert!(!transition_allowed(BrokerStatus::Closed, to));
        }
    }

    #[test]
    fn test_failed_close_stays_failed() {
        assert!(!transition_allowed(BrokerStatus::Failed, BrokerStatus::Closed));
        // but a reconnect attempt may recover a failed broker
        assert!(transition_allowed(BrokerStatus::Failed, BrokerStatus::Connecting));
        assert!(transition_allowed(BrokerStatus::Failed, BrokerStatus::Connected));
    }

    #[test]
    fn test_same_state_is_rejected() {
        assert!(!transition_allowed(
            BrokerStatus::Connected,
            BrokerStatus::Connected
        ));
    }

    #[test]
    fn test_connected_only_on_ready() {
        assert_eq!(status_for_event(TransportEvent::Connected), None);
        assert_eq!(
            status_for_event(TransportEvent::Ready),
            Some(BrokerStatus::Connected)
        );
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(
            status_for_event(TransportEvent::Disconnected),
            Some(BrokerStatus::Disconnected)
        );
        assert_eq!(
            status_for_event(TransportEvent::Failed),
            Some(BrokerStatus::Failed)
        );
        assert_eq!(
            status_for_event(TransportEvent::Closed),
            Some(BrokerStatus::Closed)
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(BrokerStatus::Connected.to_string(), "connected");
        assert_eq!(BrokerStatus::Stopping.to_string(), "stopping");
    }
}
