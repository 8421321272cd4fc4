//! Analysis plugin contract for tracemill.
//!
//! Workers own a [`PluginSet`]: one instance of every configured plugin,
//! fed packets and interval boundaries. When an interval closes, each
//! plugin hands back an opaque [`Artifact`] summarizing its view of that
//! interval. The merging side owns a [`MergeSet`], a second, independent
//! instance of every plugin that folds the per-worker artifacts for a
//! completed interval into the plugin's output stream.

pub mod builtin;
pub mod descriptor;
pub mod error;
pub mod packet;
pub mod registry;
pub mod set;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use descriptor::PluginDescriptor;
pub use error::PluginError;
pub use packet::{FlowKey, Packet, PacketTags};
pub use set::{
    AnalysisPlugin, Artifact, ArtifactSet, FinishedInterval, MergeSet, MergingPlugin, PluginSet,
};
