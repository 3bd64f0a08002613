//! Option structs for the HA client.
//!
//! Everything here is serde-deserializable and can be loaded from a TOML
//! file; credentials may be given directly or through `*_env` environment
//! variable indirection. Runtime callbacks (exception, non-delivery,
//! update-status) cannot be deserialized and are installed through
//! [`crate::ha::HaCallbacks`] instead.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{DeclareFlags, ExchangeType};

/// Broker selection order for publishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionOrder {
    /// Walk brokers in priority (list) order
    #[default]
    Priority,
    /// Shuffle the candidate list per publish
    Random,
}

/// Client-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HaClientOptions {
    /// Comma-separated broker hosts with optional `:index`
    pub host: Option<String>,
    /// Comma-separated broker ports with optional `:index`
    pub port: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_pass")]
    pub pass: String,
    /// Environment variable overriding `user`
    pub user_env: Option<String>,
    /// Environment variable overriding `pass`
    pub pass_env: Option<String>,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Forbid broker connection redirection
    #[serde(default)]
    pub insist: bool,
    /// Seconds between reconnect attempts; the per-connect delay is drawn
    /// uniformly from `[0, reconnect_interval)`
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Seconds between transport heartbeats; absent or 0 disables
    pub heartbeat: Option<u16>,
    /// Unacked-message window; absent or 0 means unbounded
    pub prefetch: Option<u16>,
    #[serde(default)]
    pub order: SelectionOrder,
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_pass() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_reconnect_interval() -> u64 {
    60
}

impl Default for HaClientOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            user: default_user(),
            pass: default_pass(),
            user_env: None,
            pass_env: None,
            vhost: default_vhost(),
            insist: false,
            reconnect_interval_secs: default_reconnect_interval(),
            heartbeat: None,
            prefetch: None,
            order: SelectionOrder::default(),
        }
    }
}

impl HaClientOptions {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Username, honoring the `user_env` indirection
    pub fn resolved_user(&self) -> String {
        self.user_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_else(|| self.user.clone())
    }

    /// Password, honoring the `pass_env` indirection
    pub fn resolved_pass(&self) -> String {
        self.pass_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_else(|| self.pass.clone())
    }

    /// Heartbeat with 0 normalized to disabled
    pub fn effective_heartbeat(&self) -> Option<u16> {
        self.heartbeat.filter(|&h| h > 0)
    }

    /// Prefetch with 0 normalized to unbounded
    pub fn effective_prefetch(&self) -> Option<u16> {
        self.prefetch.filter(|&p| p > 0)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// A queue to declare and consume from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default)]
    pub flags: DeclareFlags,
}

impl QueueSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: DeclareFlags::default(),
        }
    }

    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: DeclareFlags {
                durable: true,
                ..Default::default()
            },
        }
    }
}

/// An exchange to declare and publish through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    #[serde(rename = "type")]
    pub kind: ExchangeType,
    pub name: String,
    #[serde(default)]
    pub flags: DeclareFlags,
}

impl ExchangeSpec {
    pub fn new(kind: ExchangeType, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            flags: DeclareFlags::default(),
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(ExchangeType::Direct, name)
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(ExchangeType::Fanout, name)
    }

    /// The default (nameless) exchange; publishes route straight to the
    /// queue named by the routing key.
    pub fn default_exchange() -> Self {
        Self::new(ExchangeType::Direct, "")
    }
}

/// Options for a single publish, beyond the packet itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Routing key; defaults to the packet destination semantics of the
    /// exchange in use
    pub routing_key: Option<String>,
    #[serde(default)]
    pub persistent: bool,
    /// Ask brokers to return the message when unroutable, enabling
    /// re-routing through a peer broker
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub immediate: bool,
    /// Publish to every usable broker instead of stopping at first success
    #[serde(default)]
    pub fanout: bool,
    /// Restrict and order the candidate brokers by identity
    pub brokers: Option<Vec<String>>,
    /// Override the client-wide selection order
    pub order: Option<SelectionOrder>,
    /// Send the packet payload bytes without invoking the serializer
    #[serde(default)]
    pub no_serialize: bool,
    /// Force exchange re-declaration before publishing
    #[serde(default)]
    pub declare: bool,
    /// Payload fields to include in the SEND log line
    pub log_filter: Option<Vec<String>>,
    pub log_data: Option<String>,
    #[serde(default)]
    pub no_log: bool,
}

/// Options for a subscription
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscribeOptions {
    /// Explicitly acknowledge deliveries (before the handler runs, biasing
    /// toward at-most-once under crash)
    #[serde(default)]
    pub ack: bool,
    /// Hand raw bytes to the handler without decoding
    #[serde(default)]
    pub no_unserialize: bool,
    /// Skip queue and exchange declaration
    #[serde(default)]
    pub no_declare: bool,
    /// Second exchange to declare and bind to
    pub exchange2: Option<ExchangeSpec>,
    /// Binding key; defaults to the queue name
    pub key: Option<String>,
    /// Restrict to these broker identities
    pub brokers: Option<Vec<String>>,
    pub category: Option<String>,
    pub log_data: Option<String>,
    #[serde(default)]
    pub no_log: bool,
    /// Allowed packet kinds mapped to the payload fields worth logging;
    /// empty means all kinds pass
    #[serde(default)]
    pub kinds: std::collections::HashMap<String, Vec<String>>,
}

impl SubscribeOptions {
    /// Whether a decoded packet kind passes the filter
    pub fn allows(&self, kind: &str) -> bool {
        self.kinds.is_empty() || self.kinds.contains_key(kind)
    }
}
