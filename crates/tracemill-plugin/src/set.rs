//! Plugin instance sets: the per-worker analysis side and the merging side.

use std::any::Any;

use tracing::{debug, error};

use crate::descriptor::PluginDescriptor;
use crate::error::PluginError;
use crate::packet::{Packet, PacketTags};
use crate::registry;

/// Opaque per-plugin, per-interval result. Produced by a worker's plugin
/// instance at interval end, consumed (downcast) by the same plugin's
/// merging instance.
pub type Artifact = Box<dyn Any + Send>;

/// One worker's artifacts for one interval, ordered by plugin position.
pub type ArtifactSet = Vec<Artifact>;

/// A completed interval: the full `[worker][plugin]` artifact grid
/// gathered by the merger's barrier.
pub struct FinishedInterval {
    pub interval_id: u32,
    pub timestamp: u32,
    pub worker_artifacts: Vec<ArtifactSet>,
}

/// Worker-side plugin lifecycle.
pub trait AnalysisPlugin: Send {
    fn name(&self) -> &'static str;

    fn interval_start(&mut self, number: u32, start_time: u32);

    fn process_packet(&mut self, packet: &Packet, tags: Option<&PacketTags>);

    fn interval_end(&mut self, number: u32, end_time: u32) -> Result<Artifact, PluginError>;

    fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Merger-side plugin lifecycle. `artifacts` holds one artifact per
/// contributing worker, in barrier arrival order.
pub trait MergingPlugin: Send {
    fn name(&self) -> &'static str;

    fn merge(
        &mut self,
        interval_id: u32,
        timestamp: u32,
        artifacts: ArtifactSet,
    ) -> Result<(), PluginError>;

    fn rotate_output(&mut self) -> Result<(), PluginError>;

    fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// The set of analysis plugin instances owned by a single worker.
pub struct PluginSet {
    worker_id: usize,
    plugins: Vec<Box<dyn AnalysisPlugin>>,
}

impl PluginSet {
    /// Instantiate every configured plugin for the given worker.
    pub fn start(descriptors: &[PluginDescriptor], worker_id: usize) -> Result<Self, PluginError> {
        if descriptors.is_empty() {
            return Err(PluginError::NoPlugins);
        }
        let plugins = descriptors
            .iter()
            .map(|d| registry::build_analysis(d, worker_id))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("worker {worker_id}: started {} plugins", plugins.len());
        Ok(Self { worker_id, plugins })
    }

    /// Build a set from already-constructed plugin instances.
    pub fn from_plugins(plugins: Vec<Box<dyn AnalysisPlugin>>, worker_id: usize) -> Self {
        Self { worker_id, plugins }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn push_interval_start(&mut self, number: u32, start_time: u32) {
        for plugin in &mut self.plugins {
            plugin.interval_start(number, start_time);
        }
    }

    pub fn push_packet(&mut self, packet: &Packet, tags: Option<&PacketTags>) {
        for plugin in &mut self.plugins {
            plugin.process_packet(packet, tags);
        }
    }

    /// Close the interval in every plugin and collect their artifacts.
    ///
    /// The first plugin failure aborts the collection: the caller gets no
    /// artifacts for this closure at all, never a partial set.
    pub fn push_interval_end(
        &mut self,
        number: u32,
        end_time: u32,
    ) -> Result<ArtifactSet, PluginError> {
        let mut artifacts = Vec::with_capacity(self.plugins.len());
        for plugin in &mut self.plugins {
            artifacts.push(plugin.interval_end(number, end_time)?);
        }
        Ok(artifacts)
    }

    pub fn stop(&mut self) -> Result<(), PluginError> {
        let mut first_err = None;
        for plugin in &mut self.plugins {
            if let Err(e) = plugin.stop() {
                error!("plugin {}: error while stopping: {e}", plugin.name());
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The set of merging plugin instances owned by the merger. Distinct
/// from every worker's [`PluginSet`].
pub struct MergeSet {
    worker_count: usize,
    plugins: Vec<Box<dyn MergingPlugin>>,
}

impl MergeSet {
    pub fn start(
        descriptors: &[PluginDescriptor],
        worker_count: usize,
    ) -> Result<Self, PluginError> {
        if descriptors.is_empty() {
            return Err(PluginError::NoPlugins);
        }
        let plugins = descriptors
            .iter()
            .map(|d| registry::build_merging(d, worker_count))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            worker_count,
            plugins,
        })
    }

    pub fn from_plugins(plugins: Vec<Box<dyn MergingPlugin>>, worker_count: usize) -> Self {
        Self {
            worker_count,
            plugins,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Fold a completed interval into every plugin's output stream.
    ///
    /// The artifact grid is transposed so each plugin receives its own
    /// column: one artifact per contributing worker. Plugin failures are
    /// logged and never abort the remaining plugins.
    pub fn merge(&mut self, interval: FinishedInterval) {
        let FinishedInterval {
            interval_id,
            timestamp,
            worker_artifacts,
        } = interval;

        let mut columns: Vec<ArtifactSet> = (0..self.plugins.len())
            .map(|_| Vec::with_capacity(self.worker_count))
            .collect();
        for worker_set in worker_artifacts {
            // A degraded worker may have contributed fewer artifacts
            // than there are plugins; the excess positions stay empty.
            for (index, artifact) in worker_set.into_iter().enumerate() {
                if let Some(column) = columns.get_mut(index) {
                    column.push(artifact);
                }
            }
        }

        for (plugin, column) in self.plugins.iter_mut().zip(columns) {
            if let Err(e) = plugin.merge(interval_id, timestamp, column) {
                error!(
                    "plugin {}: error while merging interval {interval_id}: {e}",
                    plugin.name()
                );
            }
        }
    }

    pub fn rotate_output(&mut self) {
        for plugin in &mut self.plugins {
            if let Err(e) = plugin.rotate_output() {
                error!(
                    "plugin {}: error while rotating output: {e}",
                    plugin.name()
                );
            }
        }
    }

    pub fn stop(&mut self) -> Result<(), PluginError> {
        let mut first_err = None;
        for plugin in &mut self.plugins {
            if let Err(e) = plugin.stop() {
                error!("plugin {}: error while stopping: {e}", plugin.name());
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
