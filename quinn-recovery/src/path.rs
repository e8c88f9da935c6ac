use crate::MAX_UDP_PAYLOAD;

/// IP version of the remote address
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddressFamily {
    /// IPv4, 20 bytes of IP header
    V4,
    /// IPv6, 40 bytes of IP header
    V6,
}

const UDP_HEADER_SIZE: u16 = 8;

/// Properties of the network path that are known locally
///
/// Used to translate between link-level MTUs (as configured on the local interface or reported by
/// ICMP "packet too big" messages) and UDP payload sizes, which is what all of the recovery logic
/// works with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PathProperties {
    /// MTU of the local interface the path leaves through
    pub local_mtu: u16,
    /// Address family of the peer
    pub remote_address_family: AddressFamily,
}

impl PathProperties {
    /// Bytes of IP and UDP header that precede every QUIC datagram on this path
    pub fn overhead(&self) -> u16 {
        let ip = match self.remote_address_family {
            AddressFamily::V4 => 20,
            AddressFamily::V6 => 40,
        };
        ip + UDP_HEADER_SIZE
    }

    /// Convert a link MTU into the largest UDP payload it can carry on this path
    pub fn udp_payload_size(&self, link_mtu: u16) -> u16 {
        link_mtu.saturating_sub(self.overhead())
    }

    /// Largest UDP payload the local interface allows
    pub fn max_udp_payload_size(&self) -> u16 {
        self.udp_payload_size(self.local_mtu).min(MAX_UDP_PAYLOAD)
    }
}

impl Default for PathProperties {
    /// An Ethernet path to an IPv6 peer
    fn default() -> Self {
        Self {
            local_mtu: 1500,
            remote_address_family: AddressFamily::V6,
        }
    }
}
