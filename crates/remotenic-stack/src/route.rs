//! Static routing for a stack.
//!
//! Routes are provisioned by the owner of the stack and published as a whole
//! table; readers always observe a consistent snapshot. The table is the
//! forwarding policy: on an exit stack a flow is only admitted when some
//! route covers the address its replies must travel to.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::error::StackError;

/// Identifier of a NIC within a stack. Each stack owns a single NIC.
pub type NicId = u32;

/// An IP prefix in CIDR notation, stored masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Builds a prefix, masking `addr` down to its network address.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, StackError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(StackError::InvalidCidr {
                input: format!("{addr}/{prefix_len}"),
                reason: "prefix length out of range",
            });
        }
        Ok(Self {
            addr: mask(addr, prefix_len),
            prefix_len,
        })
    }

    /// The host prefix covering exactly `addr` (`/32` or `/128`).
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `addr` falls inside this prefix. Always false across
    /// address families.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(host)) => {
                u32::from(net) == u32::from(host) & mask_v4(self.prefix_len)
            }
            (IpAddr::V6(net), IpAddr::V6(host)) => {
                u128::from(net) == u128::from(host) & mask_v6(self.prefix_len)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| StackError::InvalidCidr {
            input: s.to_string(),
            reason,
        };
        let (addr, len) = s.split_once('/').ok_or_else(|| invalid("missing '/'"))?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid("bad address"))?;
        let prefix_len: u8 = len.parse().map_err(|_| invalid("bad prefix length"))?;
        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n)),
    }
}

fn mask_v6(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        n => u128::MAX << (128 - u32::from(n)),
    }
}

fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4((u32::from(v4) & mask_v4(prefix_len)).into()),
        IpAddr::V6(v6) => IpAddr::V6((u128::from(v6) & mask_v6(prefix_len)).into()),
    }
}

/// A single route: traffic for `dest` leaves through `nic` toward `gateway`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dest: Cidr,
    pub gateway: IpAddr,
    pub nic: NicId,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} nic {}", self.dest, self.gateway, self.nic)
    }
}

/// Published route table. Mutation replaces the whole table; lookups run
/// against an immutable snapshot and match in table order.
#[derive(Debug, Default)]
pub struct RouteTable {
    snapshot: RwLock<Arc<Vec<Route>>>,
}

impl RouteTable {
    pub fn replace(&self, routes: Vec<Route>) {
        *self.snapshot.write().expect("route table lock") = Arc::new(routes);
    }

    pub fn snapshot(&self) -> Arc<Vec<Route>> {
        self.snapshot.read().expect("route table lock").clone()
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<Route> {
        self.snapshot()
            .iter()
            .find(|route| route.dest.contains(addr))
            .copied()
    }

    pub fn covers(&self, addr: IpAddr) -> bool {
        self.lookup(addr).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_masks_ipv4() {
        let cidr: Cidr = "192.168.1.134/24".parse().unwrap();
        assert_eq!(cidr.addr(), "192.168.1.0".parse::<IpAddr>().unwrap());
        assert_eq!(cidr.prefix_len(), 24);
        assert!(cidr.contains("192.168.1.7".parse().unwrap()));
        assert!(!cidr.contains("192.168.2.7".parse().unwrap()));
    }

    #[test]
    fn parses_ipv6() {
        let cidr: Cidr = "fd00:dead::1/64".parse().unwrap();
        assert_eq!(cidr.addr(), "fd00:dead::".parse::<IpAddr>().unwrap());
        assert!(cidr.contains("fd00:dead::42".parse().unwrap()));
        assert!(!cidr.contains("fd00:beef::42".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything_in_family() {
        let cidr: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(cidr.contains("8.8.8.8".parse().unwrap()));
        assert!(!cidr.contains("::1".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_prefixes() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("banana/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn table_replacement_is_atomic_for_existing_snapshots() {
        let table = RouteTable::default();
        let gw: IpAddr = "100.127.255.255".parse().unwrap();
        table.replace(vec![Route {
            dest: "10.0.0.0/8".parse().unwrap(),
            gateway: gw,
            nic: 1,
        }]);

        let before = table.snapshot();
        table.replace(Vec::new());

        assert_eq!(before.len(), 1);
        assert!(table.snapshot().is_empty());
        assert!(!table.covers("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn lookup_matches_in_table_order() {
        let table = RouteTable::default();
        let gw1: IpAddr = "1.1.1.1".parse().unwrap();
        let gw2: IpAddr = "2.2.2.2".parse().unwrap();
        table.replace(vec![
            Route {
                dest: "10.0.0.0/8".parse().unwrap(),
                gateway: gw1,
                nic: 1,
            },
            Route {
                dest: "10.0.0.0/24".parse().unwrap(),
                gateway: gw2,
                nic: 1,
            },
        ]);
        assert_eq!(table.lookup("10.0.0.9".parse().unwrap()).unwrap().gateway, gw1);
    }
}
