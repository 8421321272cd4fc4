//! Maps plugin descriptor names to built-in plugin constructors.

use crate::builtin::flowtop::{FlowTop, FlowTopMerge};
use crate::builtin::tally::{Tally, TallyMerge};
use crate::descriptor::PluginDescriptor;
use crate::error::PluginError;
use crate::set::{AnalysisPlugin, MergingPlugin};

pub fn build_analysis(
    descriptor: &PluginDescriptor,
    worker_id: usize,
) -> Result<Box<dyn AnalysisPlugin>, PluginError> {
    match descriptor.name.as_str() {
        "tally" => Ok(Box::new(Tally::from_options(&descriptor.options, worker_id)?)),
        "flowtop" => Ok(Box::new(FlowTop::from_options(
            &descriptor.options,
            worker_id,
        )?)),
        other => Err(PluginError::UnknownPlugin(other.to_string())),
    }
}

pub fn build_merging(
    descriptor: &PluginDescriptor,
    worker_count: usize,
) -> Result<Box<dyn MergingPlugin>, PluginError> {
    match descriptor.name.as_str() {
        "tally" => Ok(Box::new(TallyMerge::from_options(
            &descriptor.options,
            worker_count,
        )?)),
        "flowtop" => Ok(Box::new(FlowTopMerge::from_options(
            &descriptor.options,
            worker_count,
        )?)),
        other => Err(PluginError::UnknownPlugin(other.to_string())),
    }
}
