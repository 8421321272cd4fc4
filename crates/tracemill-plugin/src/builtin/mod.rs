//! Built-in analysis plugins.

pub mod flowtop;
pub mod tally;

mod output;
