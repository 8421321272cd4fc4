//! Captured packet representation shared by the capture pipeline and plugins.

use std::net::IpAddr;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMP6: u8 = 58;

/// A single captured packet with its decoded flow metadata.
///
/// `data` holds the captured bytes starting at the link layer; `wire_len`
/// is the original length on the wire, which may exceed `data.len()` when
/// the capture was truncated by a snap length.
#[derive(Debug, Clone)]
pub struct Packet {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub wire_len: u32,
    pub flow: Option<FlowKey>,
    pub data: Vec<u8>,
}

impl Packet {
    /// Timestamp in whole epoch seconds, the granularity interval
    /// accounting works at.
    pub fn ts(&self) -> u32 {
        self.ts_sec
    }
}

/// The 5-tuple identifying the flow a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

/// Annotations attached to a packet by the tagging engine.
///
/// Every field is optional: a provider that is disabled, or that has no
/// mapping for an address, simply leaves its fields unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketTags {
    pub src_asn: Option<u32>,
    pub dst_asn: Option<u32>,
    pub src_country: Option<[u8; 2]>,
    pub dst_country: Option<[u8; 2]>,
}

impl PacketTags {
    pub fn is_empty(&self) -> bool {
        self.src_asn.is_none()
            && self.dst_asn.is_none()
            && self.src_country.is_none()
            && self.dst_country.is_none()
    }
}
