pub mod args;
pub mod capture;
pub mod config;
pub mod filters;
pub mod hasher;
pub mod interval;
pub mod logging;
pub mod merge;
pub mod msg;
pub mod shutdown;
pub mod source;
pub mod supervisor;
pub mod tagging;
pub mod worker;
