//! Link- and network-layer decoding of captured frames into flow keys.

use std::net::IpAddr;

use pnet::packet::Packet as PnetPacket;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;

use tracemill_plugin::FlowKey;
use tracemill_plugin::packet::{PROTO_TCP, PROTO_UDP};

pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW_IP: u32 = 101;

/// Extract the 5-tuple from a captured frame. Returns `None` for frames
/// that are not IP or are too short to parse; such packets still flow
/// through the pipeline, just without flow metadata.
pub fn decode_flow(link_type: u32, data: &[u8]) -> Option<FlowKey> {
    match link_type {
        LINKTYPE_ETHERNET => {
            let ethernet = EthernetPacket::new(data)?;
            match ethernet.get_ethertype() {
                EtherTypes::Ipv4 => flow_v4(ethernet.payload()),
                EtherTypes::Ipv6 => flow_v6(ethernet.payload()),
                _ => None,
            }
        }
        LINKTYPE_RAW_IP => match data.first()? >> 4 {
            4 => flow_v4(data),
            6 => flow_v6(data),
            _ => None,
        },
        _ => None,
    }
}

fn flow_v4(data: &[u8]) -> Option<FlowKey> {
    let ip = Ipv4Packet::new(data)?;
    let proto = ip.get_next_level_protocol().0;
    let (src_port, dst_port) = ports(proto, ip.payload());
    Some(FlowKey {
        src_ip: IpAddr::V4(ip.get_source()),
        dst_ip: IpAddr::V4(ip.get_destination()),
        src_port,
        dst_port,
        proto,
    })
}

fn flow_v6(data: &[u8]) -> Option<FlowKey> {
    let ip = Ipv6Packet::new(data)?;
    let proto = ip.get_next_header().0;
    let (src_port, dst_port) = ports(proto, ip.payload());
    Some(FlowKey {
        src_ip: IpAddr::V6(ip.get_source()),
        dst_ip: IpAddr::V6(ip.get_destination()),
        src_port,
        dst_port,
        proto,
    })
}

fn ports(proto: u8, payload: &[u8]) -> (u16, u16) {
    match proto {
        PROTO_TCP => TcpPacket::new(payload)
            .map(|tcp| (tcp.get_source(), tcp.get_destination()))
            .unwrap_or((0, 0)),
        PROTO_UDP => UdpPacket::new(payload)
            .map(|udp| (udp.get_source(), udp.get_destination()))
            .unwrap_or((0, 0)),
        _ => (0, 0),
    }
}

/// Minimal Ethernet + IPv4 + UDP frame built by hand, for tests.
#[cfg(test)]
pub(crate) fn udp_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0u8; 12]); // MACs
    frame.extend_from_slice(&[0x08, 0x00]); // IPv4 ethertype

    let udp_len: u16 = 8;
    let total_len: u16 = 20 + udp_len;
    frame.push(0x45); // version + IHL
    frame.push(0);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]); // id + flags/frag
    frame.push(64); // ttl
    frame.push(PROTO_UDP);
    frame.extend_from_slice(&[0, 0]); // checksum
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);

    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0]); // checksum

    frame
}
