//! Per-interval traffic tallies.
//!
//! Each worker counts the packets and bytes it pushed during an interval,
//! broken down by transport protocol. The merging side sums the
//! per-worker tallies and appends one JSON record per interval to a
//! rotating output file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::builtin::output::IntervalWriter;
use crate::error::PluginError;
use crate::packet::{PROTO_ICMP, PROTO_ICMP6, PROTO_TCP, PROTO_UDP, Packet, PacketTags};
use crate::set::{AnalysisPlugin, Artifact, ArtifactSet, MergingPlugin};

const NAME: &str = "tally";

#[derive(Debug, Clone, Deserialize)]
struct TallyOptions {
    #[serde(default = "default_output_dir")]
    output_dir: PathBuf,
    #[serde(default = "default_prefix")]
    prefix: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_prefix() -> String {
    NAME.to_string()
}

impl Default for TallyOptions {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            prefix: default_prefix(),
        }
    }
}

fn parse_options(options: &serde_yaml::Value) -> Result<TallyOptions, PluginError> {
    if options.is_null() {
        return Ok(TallyOptions::default());
    }
    serde_yaml::from_value(options.clone())
        .map_err(|e| PluginError::InvalidOptions(NAME, e.to_string()))
}

/// One worker's counters for one interval. Doubles as the artifact type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntervalTally {
    pub packets: u64,
    pub bytes: u64,
    pub tcp: u64,
    pub udp: u64,
    pub icmp: u64,
    pub other: u64,
    pub tagged: u64,
}

impl IntervalTally {
    fn absorb(&mut self, other: &IntervalTally) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.tcp += other.tcp;
        self.udp += other.udp;
        self.icmp += other.icmp;
        self.other += other.other;
        self.tagged += other.tagged;
    }
}

pub struct Tally {
    current: IntervalTally,
}

impl Tally {
    pub fn from_options(options: &serde_yaml::Value, _worker_id: usize) -> Result<Self, PluginError> {
        parse_options(options)?;
        Ok(Self {
            current: IntervalTally::default(),
        })
    }
}

impl AnalysisPlugin for Tally {
    fn name(&self) -> &'static str {
        NAME
    }

    fn interval_start(&mut self, _number: u32, _start_time: u32) {
        self.current = IntervalTally::default();
    }

    fn process_packet(&mut self, packet: &Packet, tags: Option<&PacketTags>) {
        self.current.packets += 1;
        self.current.bytes += u64::from(packet.wire_len);
        match packet.flow.map(|f| f.proto) {
            Some(PROTO_TCP) => self.current.tcp += 1,
            Some(PROTO_UDP) => self.current.udp += 1,
            Some(PROTO_ICMP) | Some(PROTO_ICMP6) => self.current.icmp += 1,
            _ => self.current.other += 1,
        }
        if tags.is_some_and(|t| !t.is_empty()) {
            self.current.tagged += 1;
        }
    }

    fn interval_end(&mut self, _number: u32, _end_time: u32) -> Result<Artifact, PluginError> {
        Ok(Box::new(std::mem::take(&mut self.current)))
    }
}

/// The record appended to the output file for each merged interval.
#[derive(Debug, Serialize, Deserialize)]
pub struct TallyRecord {
    pub interval: u32,
    pub start_time: u32,
    pub workers: usize,
    pub packets: u64,
    pub bytes: u64,
    pub tcp: u64,
    pub udp: u64,
    pub icmp: u64,
    pub other: u64,
    pub tagged: u64,
}

pub struct TallyMerge {
    out: IntervalWriter,
}

impl TallyMerge {
    pub fn from_options(
        options: &serde_yaml::Value,
        _worker_count: usize,
    ) -> Result<Self, PluginError> {
        let options = parse_options(options)?;
        Ok(Self {
            out: IntervalWriter::new(NAME, &options.output_dir, &options.prefix),
        })
    }
}

impl MergingPlugin for TallyMerge {
    fn name(&self) -> &'static str {
        NAME
    }

    fn merge(
        &mut self,
        interval_id: u32,
        timestamp: u32,
        artifacts: ArtifactSet,
    ) -> Result<(), PluginError> {
        let mut total = IntervalTally::default();
        let workers = artifacts.len();
        for artifact in artifacts {
            let tally = artifact
                .downcast::<IntervalTally>()
                .map_err(|_| PluginError::ArtifactType(NAME))?;
            total.absorb(&tally);
        }
        let record = TallyRecord {
            interval: interval_id,
            start_time: timestamp,
            workers,
            packets: total.packets,
            bytes: total.bytes,
            tcp: total.tcp,
            udp: total.udp,
            icmp: total.icmp,
            other: total.other,
            tagged: total.tagged,
        };
        self.out.write_record(timestamp, &record)
    }

    fn rotate_output(&mut self) -> Result<(), PluginError> {
        self.out.rotate()
    }

    fn stop(&mut self) -> Result<(), PluginError> {
        self.out.close()
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::packet::FlowKey;

    fn packet(proto: u8, wire_len: u32) -> Packet {
        Packet {
            ts_sec: 100,
            ts_usec: 0,
            wire_len,
            flow: Some(FlowKey {
                src_ip: IpAddr::from([192, 0, 2, 1]),
                dst_ip: IpAddr::from([198, 51, 100, 2]),
                src_port: 1234,
                dst_port: 80,
                proto,
            }),
            data: Vec::new(),
        }
    }

    #[test]
    fn counts_by_protocol() {
        let mut tally = Tally::from_options(&serde_yaml::Value::Null, 0).unwrap();
        tally.interval_start(0, 60);
        tally.process_packet(&packet(PROTO_TCP, 60), None);
        tally.process_packet(&packet(PROTO_UDP, 120), None);
        tally.process_packet(&packet(PROTO_ICMP, 84), None);
        tally.process_packet(&packet(47, 40), None);

        let artifact = tally.interval_end(0, 120).unwrap();
        let counts = artifact.downcast::<IntervalTally>().unwrap();
        assert_eq!(counts.packets, 4);
        assert_eq!(counts.bytes, 60 + 120 + 84 + 40);
        assert_eq!(counts.tcp, 1);
        assert_eq!(counts.udp, 1);
        assert_eq!(counts.icmp, 1);
        assert_eq!(counts.other, 1);
    }

    #[test]
    fn interval_end_resets_counters() {
        let mut tally = Tally::from_options(&serde_yaml::Value::Null, 0).unwrap();
        tally.interval_start(0, 60);
        tally.process_packet(&packet(PROTO_TCP, 60), None);
        tally.interval_end(0, 120).unwrap();

        tally.interval_start(1, 120);
        let artifact = tally.interval_end(1, 180).unwrap();
        let counts = artifact.downcast::<IntervalTally>().unwrap();
        assert_eq!(counts.packets, 0);
    }

    #[test]
    fn tagged_packets_counted() {
        let mut tally = Tally::from_options(&serde_yaml::Value::Null, 0).unwrap();
        tally.interval_start(0, 60);
        let tags = PacketTags {
            src_asn: Some(64496),
            ..PacketTags::default()
        };
        tally.process_packet(&packet(PROTO_TCP, 60), Some(&tags));
        tally.process_packet(&packet(PROTO_TCP, 60), Some(&PacketTags::default()));
        tally.process_packet(&packet(PROTO_TCP, 60), None);

        let artifact = tally.interval_end(0, 120).unwrap();
        let counts = artifact.downcast::<IntervalTally>().unwrap();
        assert_eq!(counts.tagged, 1);
    }

    #[test]
    fn merge_sums_workers_and_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let options = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::from("output_dir"),
            serde_yaml::Value::from(dir.path().to_str().unwrap()),
        )]))
        .unwrap();
        let mut merge = TallyMerge::from_options(&options, 2).unwrap();

        let a = IntervalTally {
            packets: 3,
            bytes: 180,
            tcp: 3,
            ..IntervalTally::default()
        };
        let b = IntervalTally {
            packets: 2,
            bytes: 100,
            udp: 2,
            ..IntervalTally::default()
        };
        merge
            .merge(0, 1_600_000_020, vec![Box::new(a), Box::new(b)])
            .unwrap();
        merge.stop().unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let contents = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let record: TallyRecord = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(record.interval, 0);
        assert_eq!(record.workers, 2);
        assert_eq!(record.packets, 5);
        assert_eq!(record.bytes, 280);
        assert_eq!(record.tcp, 3);
        assert_eq!(record.udp, 2);
    }

    #[test]
    fn rotate_starts_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::from("output_dir"),
            serde_yaml::Value::from(dir.path().to_str().unwrap()),
        )]))
        .unwrap();
        let mut merge = TallyMerge::from_options(&options, 1).unwrap();

        let tally = IntervalTally {
            packets: 1,
            ..IntervalTally::default()
        };
        merge.merge(0, 1_600_000_000, vec![Box::new(tally)]).unwrap();
        merge.rotate_output().unwrap();
        merge.merge(1, 1_600_000_060, vec![Box::new(tally)]).unwrap();
        merge.stop().unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }
}
