//! Published-message context cache.
//!
//! When a publish opts into `mandatory` routing, the serialized message and
//! its routing context are remembered so a broker-returned copy can be
//! re-routed to a peer. Entries are keyed by the 128-bit MD5 fingerprint of
//! the serialized payload; identical payloads share a context, which is
//! fine because the context only re-routes the same bytes. Returns arrive
//! shortly after publish, so entries older than [`MAX_AGE`] are evicted
//! from the head of the recency list on every store.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use md5::{Digest, Md5};

use crate::config::{ExchangeSpec, PublishOptions};
use crate::protocol::Packet;

/// Entries older than this at store time are evicted
pub const MAX_AGE: Duration = Duration::from_secs(60);

/// 128-bit content fingerprint of a serialized message
pub type Fingerprint = [u8; 16];

/// Publish metadata needed to re-route a returned message
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub from: Option<String>,
    pub token: Option<String>,
    pub one_way: bool,
    /// Exchange the message was originally published through
    pub exchange: ExchangeSpec,
    pub options: PublishOptions,
    /// Candidate broker identities in the publish use order
    pub brokers: Vec<String>,
    /// Identities that have returned the message
    pub failed: Vec<String>,
}

impl Context {
    pub fn new(
        packet: &Packet,
        exchange: &ExchangeSpec,
        options: &PublishOptions,
        brokers: Vec<String>,
    ) -> Self {
        Self {
            name: packet.name.clone(),
            kind: Some(packet.kind.clone()),
            from: packet.from.clone(),
            token: packet.token.clone(),
            one_way: packet.one_way,
            exchange: exchange.clone(),
            options: options.clone(),
            brokers,
            failed: Vec::new(),
        }
    }

    /// Record that a broker returned the message
    pub fn record_failure(&mut self, identity: &str) {
        if !self.failed.iter().any(|id| id == identity) {
            self.failed.push(identity.to_string());
        }
    }
}

struct Entry {
    last_used: Instant,
    context: Context,
}

/// LRU-with-age cache mapping message fingerprints to publish contexts
#[derive(Default)]
pub struct PublishedCache {
    entries: HashMap<Fingerprint, Entry>,
    /// Least-recently-used at the head; every key appears exactly once
    recency: VecDeque<Fingerprint>,
}

impl PublishedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of a serialized message
    pub fn fingerprint(message: &[u8]) -> Fingerprint {
        Md5::digest(message).into()
    }

    /// Remember the context for a message, evicting aged-out entries
    pub fn store(&mut self, message: &[u8], context: Context) {
        self.store_at(Instant::now(), message, context);
    }

    pub(crate) fn store_at(&mut self, now: Instant, message: &[u8], context: Context) {
        let key = Self::fingerprint(message);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used = now;
            self.touch(&key);
        } else {
            self.entries.insert(
                key,
                Entry {
                    last_used: now,
                    context,
                },
            );
            self.recency.push_back(key);
        }

        while let Some(head) = self.recency.front() {
            let aged_out = self
                .entries
                .get(head)
                .map(|entry| now.duration_since(entry.last_used) > MAX_AGE)
                .unwrap_or(true);
            if !aged_out {
                break;
            }
            let head = *head;
            self.recency.pop_front();
            self.entries.remove(&head);
        }
    }

    /// Recover the context for a returned message, refreshing its recency
    pub fn fetch(&mut self, message: &[u8]) -> Option<Context> {
        self.fetch_at(Instant::now(), message)
    }

    pub(crate) fn fetch_at(&mut self, now: Instant, message: &[u8]) -> Option<Context> {
        let key = Self::fingerprint(message);
        let entry = self.entries.get_mut(&key)?;
        entry.last_used = now;
        let context = entry.context.clone();
        self.touch(&key);
        Some(context)
    }

    /// Mutate the stored context in place, returning a copy of the result
    pub(crate) fn update(
        &mut self,
        message: &[u8],
        mutate: impl FnOnce(&mut Context),
    ) -> Option<Context> {
        let key = Self::fingerprint(message);
        let entry = self.entries.get_mut(&key)?;
        entry.last_used = Instant::now();
        mutate(&mut entry.context);
        let context = entry.context.clone();
        self.touch(&key);
        Some(context)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move a key to the tail of the recency list
    fn touch(&mut self, key: &Fingerprint) {
        if let Some(position) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(position);
        }
        self.recency.push_back(*key);
    }
}

impl std::fmt::Debug for PublishedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedCache")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeSpec;
    use serde_json::Value;

    fn context(brokers: &[&str]) -> Context {
        let packet = Packet::new("Request", Value::Null).with_token("tok");
        Context::new(
            &packet,
            &ExchangeSpec::direct("x"),
            &PublishOptions::default(),
            brokers.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_store_and_fetch() {
        let mut cache = PublishedCache::new();
        cache.store(b"message-1", context(&["rs-broker-a-5672"]));

        let fetched = cache.fetch(b"message-1").unwrap();
        assert_eq!(fetched.token.as_deref(), Some("tok"));
        assert_eq!(fetched.brokers, vec!["rs-broker-a-5672"]);
        assert!(cache.fetch(b"message-2").is_none());
    }

    #[test]
    fn test_identical_payloads_share_context() {
        let mut cache = PublishedCache::new();
        cache.store(b"same", context(&["a"]));
        cache.store(b"same", context(&["b"]));
        assert_eq!(cache.len(), 1);
        // First context wins; the second store only refreshes recency
        assert_eq!(cache.fetch(b"same").unwrap().brokers, vec!["a"]);
    }

    #[test]
    fn test_store_evicts_aged_entries_from_head() {
        let mut cache = PublishedCache::new();
        let t0 = Instant::now();
        cache.store_at(t0, b"m1", context(&["a"]));
        cache.store_at(t0, b"m2", context(&["a"]));
        assert_eq!(cache.len(), 2);

        // Past MAX_AGE both earlier entries go; the new one stays
        let t70 = t0 + Duration::from_secs(70);
        cache.store_at(t70, b"m3", context(&["a"]));
        assert_eq!(cache.len(), 1);
        assert!(cache.fetch_at(t70, b"m1").is_none());
        assert!(cache.fetch_at(t70, b"m2").is_none());
        assert!(cache.fetch_at(t70, b"m3").is_some());
    }

    #[test]
    fn test_fetch_refreshes_recency() {
        let mut cache = PublishedCache::new();
        let t0 = Instant::now();
        cache.store_at(t0, b"m1", context(&["a"]));
        cache.store_at(t0, b"m2", context(&["a"]));

        // Touch m1 at t=30 so it survives the eviction pass at t=70
        let t30 = t0 + Duration::from_secs(30);
        assert!(cache.fetch_at(t30, b"m1").is_some());

        let t70 = t0 + Duration::from_secs(70);
        cache.store_at(t70, b"m3", context(&["a"]));
        assert!(cache.fetch_at(t70, b"m2").is_none());
        assert!(cache.fetch_at(t70, b"m1").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_update_mutates_in_place() {
        let mut cache = PublishedCache::new();
        cache.store(b"m", context(&["a", "b"]));
        let updated = cache
            .update(b"m", |ctx| ctx.record_failure("a"))
            .unwrap();
        assert_eq!(updated.failed, vec!["a"]);
        // The mutation persists for later fetches
        assert_eq!(cache.fetch(b"m").unwrap().failed, vec!["a"]);
    }

    #[test]
    fn test_record_failure_dedupes() {
        let mut ctx = context(&["a"]);
        ctx.record_failure("a");
        ctx.record_failure("a");
        assert_eq!(ctx.failed, vec!["a"]);
    }
}
