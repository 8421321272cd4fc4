//! Packet sources.
//!
//! A source yields timestamped packets until it runs dry; the capture
//! runtime owns the fan-out from a source to the worker pool. Sources
//! are named by URI in the `input_sources` configuration list, in the
//! form `scheme:path`.

use std::io;
use std::path::Path;

use thiserror::Error;

use tracemill_plugin::Packet;

pub mod decode;
pub mod pcap;
pub mod replay;

pub use pcap::PcapFileSource;
pub use replay::ReplaySource;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unsupported source '{0}'")]
    UnsupportedUri(String),

    #[error("malformed capture file: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Counters a source can report after it is exhausted. A source that
/// cannot know a counter leaves it unset.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceStats {
    pub dropped: Option<u64>,
    pub missing: Option<u64>,
}

pub trait PacketSource: Send {
    /// The next packet, or `None` once the source is exhausted. The call
    /// may block waiting for traffic.
    fn next_packet(&mut self) -> Result<Option<Packet>, SourceError>;

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}

/// Resolve a configured source URI.
pub fn open_source(uri: &str) -> Result<Box<dyn PacketSource>, SourceError> {
    if let Some(path) = uri.strip_prefix("pcapfile:") {
        return Ok(Box::new(PcapFileSource::open(Path::new(path))?));
    }
    if uri.ends_with(".pcap") {
        return Ok(Box::new(PcapFileSource::open(Path::new(uri))?));
    }
    Err(SourceError::UnsupportedUri(uri.to_string()))
}
