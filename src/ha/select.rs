//! Broker selection policy for publishes.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::warn;

use crate::broker::BrokerClient;
use crate::config::SelectionOrder;

/// Compute the candidate sequence for a publish.
///
/// An explicit identity list restricts and orders the candidates; unknown
/// identities are logged and skipped, and the default order becomes
/// priority (the listed order). Otherwise every broker is a candidate in
/// list order under the client-wide default. A random order shuffles the
/// chosen sequence.
pub(super) fn use_order(
    all: &[Arc<BrokerClient>],
    requested: Option<&[String]>,
    default_order: SelectionOrder,
    override_order: Option<SelectionOrder>,
) -> Vec<Arc<BrokerClient>> {
    let explicit = requested.map(|ids| !ids.is_empty()).unwrap_or(false);

    let mut chosen: Vec<Arc<BrokerClient>> = if explicit {
        requested
            .unwrap_or_default()
            .iter()
            .filter_map(|identity| {
                let found = all.iter().find(|b| b.identity() == identity);
                if found.is_none() {
                    warn!(%identity, "ignoring unknown broker identity in publish options");
                }
                found.cloned()
            })
            .collect()
    } else {
        all.to_vec()
    };

    let order = override_order.unwrap_or(if explicit {
        SelectionOrder::Priority
    } else {
        default_order
    });
    if order == SelectionOrder::Random {
        chosen.shuffle(&mut rand::rng());
    }
    chosen
}
