//! Host port bookkeeping.

use crate::error::{CoreError, Result};
use crate::state::model::StateDocument;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// First port handed out when a requested port is taken.
pub const FIRST_EPHEMERAL_PORT: u32 = 51000;

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host port published to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    /// TCP mapping of the same port on both sides.
    pub fn same(port: u16) -> Self {
        Self {
            host_port: port,
            container_port: port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

fn parse_port(spec: &str, part: &str) -> Result<u16> {
    let invalid = |reason: String| CoreError::InvalidPortSpec {
        spec: spec.to_string(),
        reason,
    };
    let value: u32 = part
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{part:?} is not a port number")))?;
    if value == 0 || value > u16::MAX as u32 {
        return Err(invalid(format!("{value} is outside 1-65535")));
    }
    Ok(value as u16)
}

/// Parses `HOST[:CONTAINER][/PROTO]`.
impl FromStr for PortMapping {
    type Err = CoreError;

    fn from_str(spec: &str) -> Result<Self> {
        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, proto)) => {
                let protocol = match proto.trim().to_ascii_lowercase().as_str() {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    other => {
                        return Err(CoreError::InvalidPortSpec {
                            spec: spec.to_string(),
                            reason: format!("unknown protocol {other:?}"),
                        })
                    }
                };
                (ports, protocol)
            }
            None => (spec, Protocol::Tcp),
        };

        let (host_port, container_port) = match ports.split_once(':') {
            Some((host, container)) => (parse_port(spec, host)?, parse_port(spec, container)?),
            None => {
                let port = parse_port(spec, ports)?;
                (port, port)
            }
        };

        Ok(Self {
            host_port,
            container_port,
            protocol,
        })
    }
}

/// Reserved host ports per owner plus the ephemeral cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRegistry {
    pub next_ephemeral: u32,
    #[serde(default)]
    pub reserved: BTreeMap<String, Vec<u16>>,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self {
            next_ephemeral: FIRST_EPHEMERAL_PORT,
            reserved: BTreeMap::new(),
        }
    }
}

impl PortRegistry {
    fn owner_of(&self, port: u16) -> Option<&str> {
        self.reserved
            .iter()
            .find(|(_, ports)| ports.contains(&port))
            .map(|(owner, _)| owner.as_str())
    }

    fn next_free(&mut self) -> Result<u16> {
        loop {
            let candidate = self.next_ephemeral;
            if candidate > u16::MAX as u32 {
                return Err(CoreError::PortsExhausted(candidate));
            }
            self.next_ephemeral += 1;
            let port = candidate as u16;
            if self.owner_of(port).is_none() {
                return Ok(port);
            }
        }
    }
}

impl StateDocument {
    /// Reserve a host port for `owner`.
    ///
    /// Returns `suggested` when nobody holds it, otherwise the next free
    /// ephemeral port. The cursor only moves forward.
    pub fn reserve_port(&mut self, owner: &str, suggested: u16) -> Result<u16> {
        let port = if suggested != 0 && self.ports.owner_of(suggested).is_none() {
            suggested
        } else {
            let port = self.ports.next_free()?;
            tracing::debug!(owner = %owner, requested = suggested, assigned = port, "Port taken, using ephemeral port");
            port
        };
        self.ports
            .reserved
            .entry(owner.to_string())
            .or_default()
            .push(port);
        Ok(port)
    }

    /// Release every port held by `owner`.
    pub fn release_ports(&mut self, owner: &str) -> Vec<u16> {
        self.ports.reserved.remove(owner).unwrap_or_default()
    }

    /// Release only `ports` from `owner`, keeping its other reservations.
    pub fn release_reserved(&mut self, owner: &str, ports: &[u16]) {
        if let Some(held) = self.ports.reserved.get_mut(owner) {
            held.retain(|port| !ports.contains(port));
            if held.is_empty() {
                self.ports.reserved.remove(owner);
            }
        }
    }

    /// Who holds `port`, if anyone.
    pub fn port_owner(&self, port: u16) -> Option<&str> {
        self.ports.owner_of(port)
    }

    /// Every reservation, ordered by owner.
    pub fn port_reservations(&self) -> impl Iterator<Item = (&str, &[u16])> {
        self.ports
            .reserved
            .iter()
            .map(|(owner, ports)| (owner.as_str(), ports.as_slice()))
    }
}
