use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::session::params::AddressFamily;

const V4_MAPPED_PREFIX: &str = "::ffff:";

/// Enumerates the addresses bound to a local network interface.
pub trait InterfaceLookup: Send + Sync {
    /// Addresses on `interface`, or `None` if no such interface exists.
    fn addresses(&self, interface: &str) -> Option<Vec<IpAddr>>;
}

/// [`InterfaceLookup`] backed by `getifaddrs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceLookup for SystemInterfaces {
    fn addresses(&self, interface: &str) -> Option<Vec<IpAddr>> {
        let entries = match nix::ifaddrs::getifaddrs() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate network interfaces");
                return None;
            }
        };

        let mut known = false;
        let mut addresses = Vec::new();
        for entry in entries.filter(|e| e.interface_name == interface) {
            known = true;
            let Some(storage) = entry.address else {
                continue;
            };
            if let Some(v4) = storage.as_sockaddr_in() {
                addresses.push(IpAddr::V4(v4.ip()));
            } else if let Some(v6) = storage.as_sockaddr_in6() {
                addresses.push(IpAddr::V6(v6.ip()));
            }
        }

        known.then_some(addresses)
    }
}

impl InterfaceLookup for HashMap<String, Vec<IpAddr>> {
    fn addresses(&self, interface: &str) -> Option<Vec<IpAddr>> {
        self.get(interface).cloned()
    }
}

/// Picks the address advertised to the controller as the stream source.
///
/// The local address of the signaling socket is reachable by the controller
/// by definition, which makes it a better answer than a default-address
/// guess on a multi-homed host. It is only trusted after it has been
/// classified by family and found on the interface the connection uses.
#[derive(Clone)]
pub struct AddressSelector {
    interfaces: Arc<dyn InterfaceLookup>,
}

impl AddressSelector {
    pub fn new(interfaces: Arc<dyn InterfaceLookup>) -> Self {
        Self { interfaces }
    }

    /// Decide the address to advertise, or `None` to decline.
    ///
    /// `address_override` wins unconditionally when set.
    pub fn select(
        &self,
        family: AddressFamily,
        local_address: &str,
        interface: &str,
        address_override: Option<IpAddr>,
    ) -> Option<IpAddr> {
        if let Some(address) = address_override {
            tracing::info!(%address, "using address override");
            return Some(address);
        }

        let Some(candidate) = candidate(family, local_address) else {
            tracing::debug!(local_address, ?family, "no usable local address candidate");
            return None;
        };

        match self.interfaces.addresses(interface) {
            Some(bound) if bound.contains(&candidate) => {
                tracing::debug!(%candidate, interface, "advertising connection local address");
                Some(candidate)
            }
            Some(_) => {
                tracing::warn!(%candidate, interface, "local address not bound to interface, declining");
                None
            }
            None => {
                tracing::warn!(interface, "unknown network interface, declining");
                None
            }
        }
    }
}

/// Syntactic classification of the signaling socket's local address.
fn candidate(family: AddressFamily, local_address: &str) -> Option<IpAddr> {
    let text = match family {
        AddressFamily::Ipv4 => {
            if is_dotted_quad(local_address) {
                local_address
            } else {
                local_address
                    .strip_prefix(V4_MAPPED_PREFIX)
                    .filter(|rest| is_dotted_quad(rest))?
            }
        }
        AddressFamily::Ipv6 => {
            if is_dotted_quad(local_address) {
                return None;
            }
            local_address
        }
    };
    text.parse().ok()
}

/// Four dot-separated groups of one to three ASCII digits.
fn is_dotted_quad(text: &str) -> bool {
    let mut groups = 0;
    for group in text.split('.') {
        groups += 1;
        if group.is_empty() || group.len() > 3 || !group.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    groups == 4
}
