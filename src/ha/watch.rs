//! Connection-status watchers and boundary evaluation (pure logic).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Aggregation policy for a connection-status watcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Boundary {
    /// Fire on the transition between zero and at least one connected
    #[default]
    Any,
    /// Fire on the transition between all and fewer-than-all connected
    All,
}

/// What a watcher callback is told
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    /// Every relevant broker is currently failed
    Failed,
    /// A one-off watcher expired without observing a transition
    Timeout,
}

/// Callback registered through `connection_status`
pub type StatusWatcherCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Watcher registration options
#[derive(Debug, Clone, Default)]
pub struct StatusWatcherOptions {
    pub boundary: Boundary,
    /// Restrict to these broker identities; `None` watches the whole set
    pub brokers: Option<Vec<String>>,
    /// Auto-fire `Timeout` and unregister after this long
    pub one_off: Option<Duration>,
}

pub(super) struct StatusWatcher {
    pub options: StatusWatcherOptions,
    pub callback: StatusWatcherCallback,
    pub timer: Option<JoinHandle<()>>,
}

/// Decide what a watcher should be told for one status transition.
///
/// `n` is the size of the relevant broker set, `before`/`after` the counts
/// of connected brokers within it. A boundary crossing wins; `Failed` fires
/// only when no boundary crossed and every relevant broker is failed.
pub fn evaluate(
    boundary: Boundary,
    n: usize,
    before: usize,
    after: usize,
    all_failed: bool,
) -> Option<ConnectionStatus> {
    let crossing = match boundary {
        Boundary::Any => {
            if before == 0 && after > 0 {
                Some(ConnectionStatus::Connected)
            } else if before > 0 && after == 0 {
                Some(ConnectionStatus::Disconnected)
            } else {
                None
            }
        }
        Boundary::All => {
            if before < n && after == n {
                Some(ConnectionStatus::Connected)
            } else if before == n && after < n {
                Some(ConnectionStatus::Disconnected)
            } else {
                None
            }
        }
    };
    crossing.or_else(|| (all_failed && n > 0).then_some(ConnectionStatus::Failed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_fires_on_zero_to_one() {
        assert_eq!(
            evaluate(Boundary::Any, 3, 0, 1, false),
            Some(ConnectionStatus::Connected)
        );
        // further growth is silent
        assert_eq!(evaluate(Boundary::Any, 3, 1, 2, false), None);
    }

    #[test]
    fn test_any_fires_on_one_to_zero() {
        assert_eq!(
            evaluate(Boundary::Any, 3, 1, 0, false),
            Some(ConnectionStatus::Disconnected)
        );
        assert_eq!(evaluate(Boundary::Any, 3, 2, 1, false), None);
    }

    #[test]
    fn test_all_fires_on_reaching_full() {
        assert_eq!(
            evaluate(Boundary::All, 3, 2, 3, false),
            Some(ConnectionStatus::Connected)
        );
        assert_eq!(evaluate(Boundary::All, 3, 1, 2, false), None);
    }

    #[test]
    fn test_all_fires_on_leaving_full() {
        assert_eq!(
            evaluate(Boundary::All, 3, 3, 2, false),
            Some(ConnectionStatus::Disconnected)
        );
        assert_eq!(evaluate(Boundary::All, 3, 2, 1, false), None);
    }

    #[test]
    fn test_failed_when_no_crossing() {
        assert_eq!(
            evaluate(Boundary::Any, 2, 0, 0, true),
            Some(ConnectionStatus::Failed)
        );
        assert_eq!(
            evaluate(Boundary::All, 2, 1, 1, true),
            Some(ConnectionStatus::Failed)
        );
    }

    #[test]
    fn test_crossing_wins_over_failed() {
        assert_eq!(
            evaluate(Boundary::Any, 2, 1, 0, true),
            Some(ConnectionStatus::Disconnected)
        );
    }

    #[test]
    fn test_empty_relevant_set_is_silent() {
        assert_eq!(evaluate(Boundary::Any, 0, 0, 0, true), None);
    }
}
