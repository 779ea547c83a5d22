//! Admission control by source address.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::types::VtpError;

/// Set of networks allowed to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Whitelist {
    networks: Vec<IpNet>,
}

impl Whitelist {
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self { networks }
    }

    /// Every IPv4 and IPv6 address.
    pub fn allow_all() -> Self {
        Self::new(vec![
            IpNet::V4(Default::default()),
            IpNet::V6(Default::default()),
        ])
    }

    /// Parse CIDR strings such as `"10.0.0.0/8"`. A bare address is taken as
    /// a single-host network.
    pub fn parse<S: AsRef<str>>(ranges: &[S]) -> Result<Self, VtpError> {
        let networks = ranges
            .iter()
            .map(|range| {
                let range = range.as_ref().trim();
                range
                    .parse::<IpNet>()
                    .or_else(|_| range.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|_| VtpError::config(format!("invalid network {range:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(networks))
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }

    /// Is `addr` inside any listed network?
    ///
    /// IPv4-mapped IPv6 addresses are compared as the IPv4 address they map.
    pub fn allows(&self, addr: IpAddr) -> bool {
        let addr = normalise(addr);
        self.networks.iter().any(|net| net.contains(&addr))
    }
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::allow_all()
    }
}

fn normalise(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        v4 => v4,
    }
}
