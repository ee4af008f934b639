//! Tunnel address allocation policy
//!
//! Pluggable through [`TunnelIpAllocator`]. The default hands out the lowest
//! free host address after the one reserved for the server itself.

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

/// Chooses a client address inside a server's tunnel network
///
/// # Example
/// ```ignore
/// struct Fixed(IpAddr);
///
/// impl TunnelIpAllocator for Fixed {
///     fn allocate(&self, _network: &IpNet, taken: &HashSet<IpAddr>) -> Option<IpAddr> {
///         (!taken.contains(&self.0)).then_some(self.0)
///     }
/// }
/// ```
pub trait TunnelIpAllocator: Send + Sync {
    /// Pick an address not in `taken`, or `None` when the network is full.
    /// The store guarantees `taken` is complete for the duration of the call.
    fn allocate(&self, network: &IpNet, taken: &HashSet<IpAddr>) -> Option<IpAddr>;

    /// Address the server itself uses on the tunnel interface
    fn server_address(&self, network: &IpNet) -> Option<IpAddr> {
        network.hosts().next()
    }
}

/// Lowest free host address, skipping the server's
#[derive(Debug, Clone, Copy, Default)]
pub struct NextFreeAddress;

impl TunnelIpAllocator for NextFreeAddress {
    fn allocate(&self, network: &IpNet, taken: &HashSet<IpAddr>) -> Option<IpAddr> {
        let reserved = self.server_address(network);
        network
            .hosts()
            .filter(|ip| Some(*ip) != reserved)
            .find(|ip| !taken.contains(ip))
    }
}
