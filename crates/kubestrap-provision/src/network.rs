//! Pod network range selection

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::settings::SettingsError;

/// Range used unless it would overlap the node network
pub const DEFAULT_POD_CIDR: &str = "192.168.0.0/16";

/// Range used when nodes already live inside the default one
pub const ALTERNATE_POD_CIDR: &str = "10.244.0.0/16";

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Network `addr/prefix`
    ///
    /// # Errors
    /// `InvalidCidr` when `prefix` exceeds 32
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, SettingsError> {
        if prefix > 32 {
            return Err(SettingsError::InvalidCidr(format!("{addr}/{prefix}")));
        }
        Ok(Self { addr, prefix })
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    /// Whether `ip` lies inside this network
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

impl FromStr for Cidr {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SettingsError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Cidr {
    type Error = SettingsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// The default pod range and the fallback used when nodes overlap it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodNetwork {
    pub default: Cidr,
    pub alternate: Cidr,
}

impl Default for PodNetwork {
    fn default() -> Self {
        Self {
            default: Cidr {
                addr: Ipv4Addr::new(192, 168, 0, 0),
                prefix: 16,
            },
            alternate: Cidr {
                addr: Ipv4Addr::new(10, 244, 0, 0),
                prefix: 16,
            },
        }
    }
}

impl PodNetwork {
    /// Pod range for a control plane whose primary address is `ip`
    #[must_use]
    pub fn choose(&self, ip: Ipv4Addr) -> Cidr {
        if self.default.contains(ip) {
            self.alternate
        } else {
            self.default
        }
    }
}

/// Pod range for `ip` with the stock ranges
#[must_use]
pub fn choose_cidr(ip: Ipv4Addr) -> Cidr {
    PodNetwork::default().choose(ip)
}
