use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// An address/port pair handed to exactly one agent at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl NetworkIdentity {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: u32,
    prefix_len: u8,
}

impl Subnet {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ConfigError> {
        if prefix_len > 32 {
            return Err(ConfigError::InvalidSubnet(format!("{address}/{prefix_len}")));
        }
        // Host bits are dropped, like a non-strict network parse.
        let network = u32::from(address) & Self::mask(prefix_len);
        Ok(Self { network, prefix_len })
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn num_addresses(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// Offsets of usable hosts. Network and broadcast addresses are excluded
    /// except on /31 and /32, which have none to spare.
    fn host_offsets(&self) -> RangeInclusive<u64> {
        let total = self.num_addresses();
        if total <= 2 {
            0..=total - 1
        } else {
            1..=total - 2
        }
    }

    pub fn host_count(&self) -> u64 {
        let offsets = self.host_offsets();
        offsets.end() - offsets.start() + 1
    }

    /// Host address at `index` within the usable range, if any.
    pub fn host(&self, index: u64) -> Option<Ipv4Addr> {
        let offsets = self.host_offsets();
        let offset = offsets.start().checked_add(index)?;
        if offset > *offsets.end() {
            return None;
        }
        Some(Ipv4Addr::from(self.network.wrapping_add(offset as u32)))
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask(self.prefix_len) == self.network
    }
}

impl Default for Subnet {
    /// `10.0.0.0/8`
    fn default() -> Self {
        Self {
            network: u32::from(Ipv4Addr::new(10, 0, 0, 0)),
            prefix_len: 8,
        }
    }
}

impl FromStr for Subnet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSubnet(s.to_string());
        let (address, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
        Subnet::new(address, prefix_len).map_err(|_| invalid())
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}
