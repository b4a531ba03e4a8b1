//! CIDR parsing and containment.

use crate::error::IpamError;
use std::net::IpAddr;

/// Network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Parses "10.6.0.5/16" or "fd00::5/64".
    pub fn parse(cidr: &str) -> Result<Self, IpamError> {
        let (addr, prefix_len) = cidr
            .split_once('/')
            .ok_or_else(|| IpamError::WrongInput(format!("invalid CIDR {cidr}: missing prefix length")))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| IpamError::WrongInput(format!("invalid CIDR {cidr}: {e}")))?;
        let prefix_len: u8 = prefix_len
            .parse()
            .map_err(|e| IpamError::WrongInput(format!("invalid CIDR {cidr}: {e}")))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(IpamError::WrongInput(format!(
                "invalid CIDR {cidr}: prefix length exceeds {max}"
            )));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Address part of the CIDR
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Whether `ip` is inside the network
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix_len)).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}
