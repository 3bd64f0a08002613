//! Broker address lists and identity formation.
//!
//! Broker endpoints are configured as comma-separated `host[:index]` and
//! `port[:index]` specs. Hosts and ports pair element-wise when the lists
//! have the same length; a single-element list broadcasts across the other.
//! The serialized identity `rs-broker-<host>-<port>` stably names a broker
//! instance across restarts (dashes in the host are folded to `~` so the
//! identity itself stays splittable on `-`).

use crate::error::{HaClientError, HaResult};

/// Host used when the host spec is absent
pub const DEFAULT_HOST: &str = "localhost";

/// Port used when the port spec is absent
pub const DEFAULT_PORT: u16 = 5672;

const IDENTITY_PREFIX: &str = "rs-broker-";

/// One configured broker endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    /// Stable position identifier used for the `b<index>` alias
    pub index: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16, index: u16) -> Self {
        Self {
            host: host.into(),
            port,
            index,
        }
    }

    /// Serialized identity, e.g. `rs-broker-broker0.example.com-5672`
    pub fn identity(&self) -> String {
        identity(&self.host, self.port)
    }

    /// Short log label, e.g. `b0`
    pub fn alias(&self) -> String {
        format!("b{}", self.index)
    }
}

/// Form the serialized identity for a host and port
pub fn identity(host: &str, port: u16) -> String {
    format!("{}{}-{}", IDENTITY_PREFIX, host.replace('-', "~"), port)
}

/// Recover host and port from a serialized identity.
///
/// The round trip is exact as long as the original host contained no `~`.
pub fn parse_identity(identity: &str) -> Option<(String, u16)> {
    let rest = identity.strip_prefix(IDENTITY_PREFIX)?;
    let (host, port) = rest.rsplit_once('-')?;
    let port = port.parse().ok()?;
    Some((host.replace('~', "-"), port))
}

/// Build the broker address list from host and port specs.
///
/// Pairing rules: equal-length lists pair element-wise; a length-1 list is
/// broadcast across the other; anything else is an invalid argument. Each
/// element may carry an explicit index after `:`; absent indices default to
/// the zero-based list position.
pub fn addresses(host_spec: Option<&str>, port_spec: Option<&str>) -> HaResult<Vec<BrokerAddress>> {
    let hosts = split_spec(host_spec.unwrap_or(DEFAULT_HOST))?;
    let default_port = DEFAULT_PORT.to_string();
    let ports = split_spec(port_spec.unwrap_or(&default_port))?;

    let addresses = if hosts.len() == ports.len() {
        hosts
            .iter()
            .zip(ports.iter())
            .enumerate()
            .map(|(position, ((host, host_index), (port, port_index)))| {
                build(host, port, host_index.or(*port_index), position)
            })
            .collect::<HaResult<Vec<_>>>()?
    } else if hosts.len() == 1 {
        let (host, host_index) = &hosts[0];
        ports
            .iter()
            .enumerate()
            .map(|(position, (port, port_index))| {
                build(host, port, port_index.or(*host_index), position)
            })
            .collect::<HaResult<Vec<_>>>()?
    } else if ports.len() == 1 {
        let (port, port_index) = &ports[0];
        hosts
            .iter()
            .enumerate()
            .map(|(position, (host, host_index))| {
                build(host, port, host_index.or(*port_index), position)
            })
            .collect::<HaResult<Vec<_>>>()?
    } else {
        return Err(HaClientError::InvalidArgument(format!(
            "mismatched host and port list lengths ({} vs {})",
            hosts.len(),
            ports.len()
        )));
    };

    Ok(addresses)
}

/// Extract host and port specs from `key=value&key=value` user data.
///
/// The `host` key is required; `port` is optional and defaults downstream.
pub fn parse_user_data(data: &str) -> HaResult<(String, Option<String>)> {
    if data.trim().is_empty() {
        return Err(HaClientError::NoUserData);
    }

    let mut host = None;
    let mut port = None;
    for pair in data.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            match key.trim() {
                "host" => host = Some(value.trim().to_string()),
                "port" => port = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    match host {
        Some(host) if !host.is_empty() => Ok((host, port)),
        _ => Err(HaClientError::NoBrokerHosts),
    }
}

fn build(host: &str, port: &str, index: Option<u16>, position: usize) -> HaResult<BrokerAddress> {
    if host.is_empty() {
        return Err(HaClientError::NoBrokerHosts);
    }
    let port: u16 = port.parse().map_err(|_| {
        HaClientError::InvalidArgument(format!("invalid broker port {port:?} for host {host}"))
    })?;
    Ok(BrokerAddress::new(host, port, index.unwrap_or(position as u16)))
}

/// Split a comma-separated spec into `(value, explicit_index)` pairs
fn split_spec(spec: &str) -> HaResult<Vec<(String, Option<u16>)>> {
    spec.split(',')
        .map(|element| {
            let element = element.trim();
            match element.split_once(':') {
                Some((value, index)) => {
                    let index = index.parse().map_err(|_| {
                        HaClientError::InvalidArgument(format!(
                            "invalid index {index:?} in address element {element:?}"
                        ))
                    })?;
                    Ok((value.to_string(), Some(index)))
                }
                None => Ok((element.to_string(), None)),
            }
        })
        .collect()
}
