//! Packet tagging: IP-to-ASN and IP-to-geolocation annotation.
//!
//! Three providers, each enabled independently: `pfx2as` maps prefixes to
//! origin ASNs, `maxmind` and `netacq` map prefixes to country codes.
//! Provider data is loaded once at worker start; lookups are
//! longest-prefix matches against the loaded table.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;

use thiserror::Error;
use tracing::{error, info};

use crate::config::TagProviderConfig;
use tracemill_plugin::{Packet, PacketTags};

#[derive(Error, Debug)]
pub enum TagError {
    #[error("provider has no data file configured")]
    NoDataFile,

    #[error("bad entry on line {0}: '{1}'")]
    BadEntry(usize, String),

    #[error("packet has no network header to tag")]
    NoNetworkHeader,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Longest-prefix-match table mapping networks to a value.
struct PrefixTable<T> {
    // sorted by prefix length, most specific first
    entries: Vec<(IpAddr, u8, T)>,
}

impl<T> PrefixTable<T> {
    fn new(mut entries: Vec<(IpAddr, u8, T)>) -> Self {
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        Self { entries }
    }

    fn lookup(&self, addr: &IpAddr) -> Option<&T> {
        self.entries
            .iter()
            .find(|(net, len, _)| contains(net, *len, addr))
            .map(|(_, _, value)| value)
    }
}

fn contains(net: &IpAddr, prefix_len: u8, addr: &IpAddr) -> bool {
    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = match prefix_len {
                0 => 0,
                1..=31 => u32::MAX << (32 - prefix_len),
                _ => u32::MAX,
            };
            (net.to_bits() & mask) == (addr.to_bits() & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = match prefix_len {
                0 => 0,
                1..=127 => u128::MAX << (128 - prefix_len),
                _ => u128::MAX,
            };
            (net.to_bits() & mask) == (addr.to_bits() & mask)
        }
        _ => false,
    }
}

fn parse_prefix(field: &str, line_no: usize, line: &str) -> Result<(IpAddr, u8), TagError> {
    let (addr, len) = field
        .split_once('/')
        .ok_or_else(|| TagError::BadEntry(line_no, line.to_string()))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| TagError::BadEntry(line_no, line.to_string()))?;
    let len: u8 = len
        .parse()
        .map_err(|_| TagError::BadEntry(line_no, line.to_string()))?;
    Ok((addr, len))
}

/// Load a pfx2as file: one `prefix/len asn` pair per line, `#` comments.
fn load_asn_table(path: &Path) -> Result<PrefixTable<u32>, TagError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        let prefix = fields
            .next()
            .ok_or_else(|| TagError::BadEntry(index + 1, line.clone()))?;
        let asn = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| TagError::BadEntry(index + 1, line.clone()))?;
        let (addr, len) = parse_prefix(prefix, index + 1, &line)?;
        entries.push((addr, len, asn));
    }
    Ok(PrefixTable::new(entries))
}

/// Load a geolocation file: one `prefix/len,CC` pair per line.
fn load_country_table(path: &Path) -> Result<PrefixTable<[u8; 2]>, TagError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (prefix, country) = trimmed
            .split_once(',')
            .ok_or_else(|| TagError::BadEntry(index + 1, line.clone()))?;
        let country = country.trim().as_bytes();
        if country.len() != 2 {
            return Err(TagError::BadEntry(index + 1, line.clone()));
        }
        let (addr, len) = parse_prefix(prefix.trim(), index + 1, &line)?;
        entries.push((addr, len, [country[0], country[1]]));
    }
    Ok(PrefixTable::new(entries))
}

/// The per-worker tagging engine. Each provider that fails to load is
/// logged and skipped; the tagger runs with whatever providers remain.
pub struct PacketTagger {
    pfx2as: Option<PrefixTable<u32>>,
    maxmind: Option<PrefixTable<[u8; 2]>>,
    netacq: Option<PrefixTable<[u8; 2]>>,
}

impl PacketTagger {
    pub fn new(
        pfx2as: &TagProviderConfig,
        maxmind: &TagProviderConfig,
        netacq: &TagProviderConfig,
    ) -> Self {
        Self {
            pfx2as: enable_provider("pfx2as", pfx2as, load_asn_table),
            maxmind: enable_provider("maxmind", maxmind, load_country_table),
            netacq: enable_provider("netacq", netacq, load_country_table),
        }
    }

    pub fn tag(&self, packet: &Packet) -> Result<PacketTags, TagError> {
        let flow = packet.flow.as_ref().ok_or(TagError::NoNetworkHeader)?;

        let mut tags = PacketTags::default();
        if let Some(table) = &self.pfx2as {
            tags.src_asn = table.lookup(&flow.src_ip).copied();
            tags.dst_asn = table.lookup(&flow.dst_ip).copied();
        }
        // netacq results take precedence over maxmind when both loaded
        for table in [&self.maxmind, &self.netacq].into_iter().flatten() {
            if let Some(country) = table.lookup(&flow.src_ip) {
                tags.src_country = Some(*country);
            }
            if let Some(country) = table.lookup(&flow.dst_ip) {
                tags.dst_country = Some(*country);
            }
        }
        Ok(tags)
    }
}

fn enable_provider<T>(
    name: &str,
    config: &TagProviderConfig,
    load: impl Fn(&Path) -> Result<PrefixTable<T>, TagError>,
) -> Option<PrefixTable<T>> {
    if !config.enabled {
        return None;
    }
    let result = match &config.data_file {
        Some(path) => load(path),
        None => Err(TagError::NoDataFile),
    };
    match result {
        Ok(table) => {
            info!("enabled {name} tagging ({} prefixes)", table.entries.len());
            Some(table)
        }
        Err(e) => {
            error!("error while enabling {name} tagging: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use tracemill_plugin::FlowKey;
    use tracemill_plugin::packet::PROTO_TCP;

    use super::*;

    fn data_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn provider(path: PathBuf) -> TagProviderConfig {
        TagProviderConfig {
            enabled: true,
            data_file: Some(path),
        }
    }

    fn packet(src: [u8; 4], dst: [u8; 4]) -> Packet {
        Packet {
            ts_sec: 0,
            ts_usec: 0,
            wire_len: 60,
            flow: Some(FlowKey {
                src_ip: IpAddr::from(src),
                dst_ip: IpAddr::from(dst),
                src_port: 1234,
                dst_port: 80,
                proto: PROTO_TCP,
            }),
            data: Vec::new(),
        }
    }

    #[test]
    fn asn_lookup_prefers_longest_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = data_file(
            &dir,
            "pfx2as.txt",
            "# prefix asn\n192.0.2.0/24 64496\n192.0.2.128/25 64497\n",
        );
        let tagger = PacketTagger::new(
            &provider(path),
            &TagProviderConfig::default(),
            &TagProviderConfig::default(),
        );

        let tags = tagger.tag(&packet([192, 0, 2, 200], [192, 0, 2, 1])).unwrap();
        assert_eq!(tags.src_asn, Some(64497));
        assert_eq!(tags.dst_asn, Some(64496));
    }

    #[test]
    fn country_lookup_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = data_file(&dir, "geo.csv", "198.51.100.0/24,NZ\n203.0.113.0/24,US\n");
        let tagger = PacketTagger::new(
            &TagProviderConfig::default(),
            &provider(path),
            &TagProviderConfig::default(),
        );

        let tags = tagger
            .tag(&packet([198, 51, 100, 7], [203, 0, 113, 9]))
            .unwrap();
        assert_eq!(tags.src_country, Some(*b"NZ"));
        assert_eq!(tags.dst_country, Some(*b"US"));
    }

    #[test]
    fn unknown_addresses_stay_untagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = data_file(&dir, "pfx2as.txt", "192.0.2.0/24 64496\n");
        let tagger = PacketTagger::new(
            &provider(path),
            &TagProviderConfig::default(),
            &TagProviderConfig::default(),
        );

        let tags = tagger.tag(&packet([8, 8, 8, 8], [9, 9, 9, 9])).unwrap();
        assert!(tags.is_empty());
    }

    #[test]
    fn flowless_packet_is_a_tag_error() {
        let tagger = PacketTagger::new(
            &TagProviderConfig::default(),
            &TagProviderConfig::default(),
            &TagProviderConfig::default(),
        );
        let bare = Packet {
            ts_sec: 0,
            ts_usec: 0,
            wire_len: 60,
            flow: None,
            data: Vec::new(),
        };
        assert!(matches!(tagger.tag(&bare), Err(TagError::NoNetworkHeader)));
    }

    #[test]
    fn missing_data_file_disables_provider() {
        let broken = TagProviderConfig {
            enabled: true,
            data_file: Some(PathBuf::from("/nonexistent/pfx2as.txt")),
        };
        let tagger = PacketTagger::new(
            &broken,
            &TagProviderConfig::default(),
            &TagProviderConfig::default(),
        );
        let tags = tagger.tag(&packet([192, 0, 2, 1], [192, 0, 2, 2])).unwrap();
        assert!(tags.is_empty());
    }
}
