//! Bidirectional flow hashing for worker assignment.

use std::hash::{DefaultHasher, Hash, Hasher};

use tracemill_plugin::Packet;

/// Assigns packets to workers so that both directions of a flow land on
/// the same worker. Packets without a decoded flow all go to worker 0.
#[derive(Debug, Clone, Copy)]
pub struct FlowHasher {
    worker_count: usize,
}

impl FlowHasher {
    pub fn new(worker_count: usize) -> Self {
        Self { worker_count }
    }

    pub fn assign(&self, packet: &Packet) -> usize {
        let Some(flow) = &packet.flow else {
            return 0;
        };

        let mut hasher = DefaultHasher::new();
        let forward = (flow.src_ip, flow.src_port);
        let reverse = (flow.dst_ip, flow.dst_port);
        // canonical endpoint order, so both directions hash identically
        if forward <= reverse {
            forward.hash(&mut hasher);
            reverse.hash(&mut hasher);
        } else {
            reverse.hash(&mut hasher);
            forward.hash(&mut hasher);
        }
        flow.proto.hash(&mut hasher);

        (hasher.finish() % self.worker_count as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use tracemill_plugin::FlowKey;
    use tracemill_plugin::packet::PROTO_TCP;

    use super::*;

    fn packet(flow: Option<FlowKey>) -> Packet {
        Packet {
            ts_sec: 0,
            ts_usec: 0,
            wire_len: 60,
            flow,
            data: Vec::new(),
        }
    }

    #[test]
    fn both_directions_hash_to_the_same_worker() {
        let hasher = FlowHasher::new(7);
        let forward = FlowKey {
            src_ip: IpAddr::from([192, 0, 2, 10]),
            dst_ip: IpAddr::from([198, 51, 100, 20]),
            src_port: 40000,
            dst_port: 443,
            proto: PROTO_TCP,
        };
        let reverse = FlowKey {
            src_ip: forward.dst_ip,
            dst_ip: forward.src_ip,
            src_port: forward.dst_port,
            dst_port: forward.src_port,
            proto: PROTO_TCP,
        };

        assert_eq!(
            hasher.assign(&packet(Some(forward))),
            hasher.assign(&packet(Some(reverse)))
        );
    }

    #[test]
    fn flowless_packets_go_to_worker_zero() {
        let hasher = FlowHasher::new(4);
        assert_eq!(hasher.assign(&packet(None)), 0);
    }

    #[test]
    fn assignment_is_within_bounds() {
        let hasher = FlowHasher::new(3);
        for octet in 0..100u8 {
            let flow = FlowKey {
                src_ip: IpAddr::from([10, 0, 0, octet]),
                dst_ip: IpAddr::from([198, 51, 100, 20]),
                src_port: 1000 + u16::from(octet),
                dst_port: 53,
                proto: PROTO_TCP,
            };
            assert!(hasher.assign(&packet(Some(flow))) < 3);
        }
    }
}
