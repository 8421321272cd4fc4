//! Top talkers by source address.
//!
//! Workers count packets per source address within each interval; the
//! merging side folds the per-worker maps and writes the heaviest N
//! sources as one JSON record per interval.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::builtin::output::IntervalWriter;
use crate::error::PluginError;
use crate::packet::{Packet, PacketTags};
use crate::set::{AnalysisPlugin, Artifact, ArtifactSet, MergingPlugin};

const NAME: &str = "flowtop";

#[derive(Debug, Clone, Deserialize)]
struct FlowTopOptions {
    #[serde(default = "default_output_dir")]
    output_dir: PathBuf,
    #[serde(default = "default_prefix")]
    prefix: String,
    #[serde(default = "default_top_n")]
    top_n: usize,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_prefix() -> String {
    NAME.to_string()
}

fn default_top_n() -> usize {
    10
}

impl Default for FlowTopOptions {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            prefix: default_prefix(),
            top_n: default_top_n(),
        }
    }
}

fn parse_options(options: &serde_yaml::Value) -> Result<FlowTopOptions, PluginError> {
    if options.is_null() {
        return Ok(FlowTopOptions::default());
    }
    serde_yaml::from_value(options.clone())
        .map_err(|e| PluginError::InvalidOptions(NAME, e.to_string()))
}

/// Per-worker artifact: packet counts keyed by source address.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SourceCounts(pub HashMap<IpAddr, u64>);

pub struct FlowTop {
    current: SourceCounts,
}

impl FlowTop {
    pub fn from_options(options: &serde_yaml::Value, _worker_id: usize) -> Result<Self, PluginError> {
        parse_options(options)?;
        Ok(Self {
            current: SourceCounts::default(),
        })
    }
}

impl AnalysisPlugin for FlowTop {
    fn name(&self) -> &'static str {
        NAME
    }

    fn interval_start(&mut self, _number: u32, _start_time: u32) {
        self.current.0.clear();
    }

    fn process_packet(&mut self, packet: &Packet, _tags: Option<&PacketTags>) {
        if let Some(flow) = &packet.flow {
            *self.current.0.entry(flow.src_ip).or_insert(0) += 1;
        }
    }

    fn interval_end(&mut self, _number: u32, _end_time: u32) -> Result<Artifact, PluginError> {
        Ok(Box::new(std::mem::take(&mut self.current)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopSource {
    pub addr: IpAddr,
    pub packets: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlowTopRecord {
    pub interval: u32,
    pub start_time: u32,
    pub sources: Vec<TopSource>,
}

pub struct FlowTopMerge {
    top_n: usize,
    out: IntervalWriter,
}

impl FlowTopMerge {
    pub fn from_options(
        options: &serde_yaml::Value,
        _worker_count: usize,
    ) -> Result<Self, PluginError> {
        let options = parse_options(options)?;
        Ok(Self {
            top_n: options.top_n,
            out: IntervalWriter::new(NAME, &options.output_dir, &options.prefix),
        })
    }
}

impl MergingPlugin for FlowTopMerge {
    fn name(&self) -> &'static str {
        NAME
    }

    fn merge(
        &mut self,
        interval_id: u32,
        timestamp: u32,
        artifacts: ArtifactSet,
    ) -> Result<(), PluginError> {
        let mut totals: HashMap<IpAddr, u64> = HashMap::new();
        for artifact in artifacts {
            let counts = artifact
                .downcast::<SourceCounts>()
                .map_err(|_| PluginError::ArtifactType(NAME))?;
            for (addr, packets) in counts.0 {
                *totals.entry(addr).or_insert(0) += packets;
            }
        }

        let mut sources: Vec<TopSource> = totals
            .into_iter()
            .map(|(addr, packets)| TopSource { addr, packets })
            .collect();
        // heaviest first; ties broken by address so output is stable
        sources.sort_by(|a, b| b.packets.cmp(&a.packets).then(a.addr.cmp(&b.addr)));
        sources.truncate(self.top_n);

        let record = FlowTopRecord {
            interval: interval_id,
            start_time: timestamp,
            sources,
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
    use super::*;
    use crate::packet::{FlowKey, PROTO_UDP};

    fn packet_from(src: [u8; 4]) -> Packet {
        Packet {
            ts_sec: 100,
            ts_usec: 0,
            wire_len: 60,
            flow: Some(FlowKey {
                src_ip: IpAddr::from(src),
                dst_ip: IpAddr::from([198, 51, 100, 2]),
                src_port: 53,
                dst_port: 4242,
                proto: PROTO_UDP,
            }),
            data: Vec::new(),
        }
    }

    #[test]
    fn merge_folds_workers_and_ranks_sources() {
        let dir = tempfile::tempdir().unwrap();
        let options = serde_yaml::to_value(serde_yaml::Mapping::from_iter([
            (
                serde_yaml::Value::from("output_dir"),
                serde_yaml::Value::from(dir.path().to_str().unwrap()),
            ),
            (serde_yaml::Value::from("top_n"), serde_yaml::Value::from(2)),
        ]))
        .unwrap();

        let mut worker_a = FlowTop::from_options(&options, 0).unwrap();
        let mut worker_b = FlowTop::from_options(&options, 1).unwrap();
        worker_a.interval_start(0, 60);
        worker_b.interval_start(0, 60);
        for _ in 0..3 {
            worker_a.process_packet(&packet_from([192, 0, 2, 1]), None);
        }
        worker_a.process_packet(&packet_from([192, 0, 2, 9]), None);
        for _ in 0..2 {
            worker_b.process_packet(&packet_from([192, 0, 2, 1]), None);
        }
        worker_b.process_packet(&packet_from([192, 0, 2, 7]), None);

        let mut merge = FlowTopMerge::from_options(&options, 2).unwrap();
        merge
            .merge(
                0,
                1_600_000_000,
                vec![
                    worker_a.interval_end(0, 120).unwrap(),
                    worker_b.interval_end(0, 120).unwrap(),
                ],
            )
            .unwrap();
        merge.stop().unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let contents = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let record: FlowTopRecord = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(record.sources.len(), 2);
        assert_eq!(record.sources[0].addr, IpAddr::from([192, 0, 2, 1]));
        assert_eq!(record.sources[0].packets, 5);
    }

    #[test]
    fn wrong_artifact_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::from("output_dir"),
            serde_yaml::Value::from(dir.path().to_str().unwrap()),
        )]))
        .unwrap();
        let mut merge = FlowTopMerge::from_options(&options, 1).unwrap();

        let bogus: Artifact = Box::new(42u64);
        let result = merge.merge(0, 1_600_000_000, vec![bogus]);
        assert!(matches!(result, Err(PluginError::ArtifactType(_))));
    }
}
