//! pcap savefile reader.
//!
//! Handles classic pcap (not pcapng) in either byte order, with
//! microsecond or nanosecond timestamp resolution.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::debug;

use crate::source::decode::decode_flow;
use crate::source::{PacketSource, SourceError};
use tracemill_plugin::Packet;

const MAGIC_USEC: u32 = 0xa1b2_c3d4;
const MAGIC_NSEC: u32 = 0xa1b2_3c4d;

// Longest capture length we are willing to believe; anything bigger is
// a corrupt record header.
const MAX_CAPTURED: u32 = 1 << 20;

pub struct PcapFileSource {
    reader: BufReader<File>,
    swapped: bool,
    nanos: bool,
    link_type: u32,
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 24];
        reader.read_exact(&mut header)?;

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let (swapped, nanos) = match magic {
            MAGIC_USEC => (false, false),
            MAGIC_NSEC => (false, true),
            m if m == MAGIC_USEC.swap_bytes() => (true, false),
            m if m == MAGIC_NSEC.swap_bytes() => (true, true),
            other => {
                return Err(SourceError::Format(format!(
                    "unrecognized magic {other:#010x}"
                )));
            }
        };

        let field = |bytes: [u8; 4]| {
            let value = u32::from_le_bytes(bytes);
            if swapped { value.swap_bytes() } else { value }
        };
        let link_type = field([header[20], header[21], header[22], header[23]]);

        debug!(
            "opened pcap file {} (link type {link_type}, {} timestamps)",
            path.display(),
            if nanos { "nanosecond" } else { "microsecond" }
        );

        Ok(Self {
            reader,
            swapped,
            nanos,
            link_type,
        })
    }

    fn field(&self, bytes: [u8; 4]) -> u32 {
        let value = u32::from_le_bytes(bytes);
        if self.swapped {
            value.swap_bytes()
        } else {
            value
        }
    }

    /// Fill `buf` completely. `Ok(false)` means a clean end-of-file
    /// before the first byte; a partial read is a format error.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool, SourceError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(SourceError::Format("truncated record".to_string()));
            }
            filled += n;
        }
        Ok(true)
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Option<Packet>, SourceError> {
        let mut header = [0u8; 16];
        if !self.fill(&mut header)? {
            return Ok(None);
        }

        let ts_sec = self.field([header[0], header[1], header[2], header[3]]);
        let ts_frac = self.field([header[4], header[5], header[6], header[7]]);
        let incl_len = self.field([header[8], header[9], header[10], header[11]]);
        let orig_len = self.field([header[12], header[13], header[14], header[15]]);

        if incl_len > MAX_CAPTURED {
            return Err(SourceError::Format(format!(
                "implausible captured length {incl_len}"
            )));
        }

        let mut data = vec![0u8; incl_len as usize];
        if !self.fill(&mut data)? {
            return Err(SourceError::Format("truncated record".to_string()));
        }

        let ts_usec = if self.nanos { ts_frac / 1000 } else { ts_frac };
        let flow = decode_flow(self.link_type, &data);

        Ok(Some(Packet {
            ts_sec,
            ts_usec,
            wire_len: orig_len,
            flow,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tracemill_plugin::packet::PROTO_UDP;

    use super::*;
    use crate::source::decode::LINKTYPE_ETHERNET;

    fn write_header(out: &mut Vec<u8>, magic: u32, link_type: u32, big_endian: bool) {
        let put = |out: &mut Vec<u8>, v: u32| {
            if big_endian {
                out.extend_from_slice(&v.to_be_bytes());
            } else {
                out.extend_from_slice(&v.to_le_bytes());
            }
        };
        put(out, magic);
        if big_endian {
            out.extend_from_slice(&2u16.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
        } else {
            out.extend_from_slice(&2u16.to_le_bytes());
            out.extend_from_slice(&4u16.to_le_bytes());
        }
        put(out, 0); // thiszone
        put(out, 0); // sigfigs
        put(out, 65535); // snaplen
        put(out, link_type);
    }

    fn write_record(out: &mut Vec<u8>, ts_sec: u32, ts_frac: u32, data: &[u8], big_endian: bool) {
        let put = |out: &mut Vec<u8>, v: u32| {
            if big_endian {
                out.extend_from_slice(&v.to_be_bytes());
            } else {
                out.extend_from_slice(&v.to_le_bytes());
            }
        };
        put(out, ts_sec);
        put(out, ts_frac);
        put(out, data.len() as u32);
        put(out, data.len() as u32);
        out.extend_from_slice(data);
    }

    fn frame() -> Vec<u8> {
        crate::source::decode::udp_frame([192, 0, 2, 1], [198, 51, 100, 2], 5353, 53)
    }

    fn write_file(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        File::create(&path).unwrap().write_all(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_little_endian_microsecond_file() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, MAGIC_USEC, LINKTYPE_ETHERNET, false);
        write_record(&mut bytes, 1_600_000_000, 250_000, &frame(), false);
        write_record(&mut bytes, 1_600_000_001, 0, &frame(), false);
        let (_dir, path) = write_file(&bytes);

        let mut source = PcapFileSource::open(&path).unwrap();
        let first = source.next_packet().unwrap().unwrap();
        assert_eq!(first.ts_sec, 1_600_000_000);
        assert_eq!(first.ts_usec, 250_000);
        assert_eq!(first.flow.unwrap().proto, PROTO_UDP);

        let second = source.next_packet().unwrap().unwrap();
        assert_eq!(second.ts_sec, 1_600_000_001);

        assert!(source.next_packet().unwrap().is_none());
    }

    #[test]
    fn reads_byte_swapped_file() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, MAGIC_USEC, LINKTYPE_ETHERNET, true);
        write_record(&mut bytes, 1_600_000_000, 0, &frame(), true);
        let (_dir, path) = write_file(&bytes);

        let mut source = PcapFileSource::open(&path).unwrap();
        let packet = source.next_packet().unwrap().unwrap();
        assert_eq!(packet.ts_sec, 1_600_000_000);
    }

    #[test]
    fn converts_nanosecond_timestamps() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, MAGIC_NSEC, LINKTYPE_ETHERNET, false);
        write_record(&mut bytes, 1_600_000_000, 250_000_000, &frame(), false);
        let (_dir, path) = write_file(&bytes);

        let mut source = PcapFileSource::open(&path).unwrap();
        let packet = source.next_packet().unwrap().unwrap();
        assert_eq!(packet.ts_usec, 250_000);
    }

    #[test]
    fn rejects_bad_magic() {
        let (_dir, path) = write_file(&[0u8; 24]);
        assert!(matches!(
            PcapFileSource::open(&path),
            Err(SourceError::Format(_))
        ));
    }

    #[test]
    fn rejects_truncated_record() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, MAGIC_USEC, LINKTYPE_ETHERNET, false);
        write_record(&mut bytes, 1_600_000_000, 0, &frame(), false);
        bytes.truncate(bytes.len() - 10);
        let (_dir, path) = write_file(&bytes);

        let mut source = PcapFileSource::open(&path).unwrap();
        assert!(matches!(
            source.next_packet(),
            Err(SourceError::Format(_))
        ));
    }
}
