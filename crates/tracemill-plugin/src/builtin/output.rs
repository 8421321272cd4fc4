//! Rotating JSON-lines output files shared by the built-in plugins.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::PluginError;

/// Appends one JSON record per merged interval to a file in the output
/// directory. `rotate()` closes the current file; the next record opens
/// a fresh one, named after the interval timestamp it begins with.
pub(crate) struct IntervalWriter {
    plugin: &'static str,
    dir: PathBuf,
    prefix: String,
    file: Option<BufWriter<File>>,
}

impl IntervalWriter {
    pub(crate) fn new(plugin: &'static str, dir: &Path, prefix: &str) -> Self {
        Self {
            plugin,
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            file: None,
        }
    }

    pub(crate) fn write_record<T: Serialize>(
        &mut self,
        interval_time: u32,
        record: &T,
    ) -> Result<(), PluginError> {
        if self.file.is_none() {
            self.file = Some(self.open(interval_time)?);
        }
        if let Some(file) = self.file.as_mut() {
            serde_json::to_writer(&mut *file, record).map_err(std::io::Error::other)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    fn open(&self, interval_time: u32) -> Result<BufWriter<File>, PluginError> {
        let pattern = format!("{}-%Y%m%d-%H%M%S.jsonl", self.prefix);
        let name = time_format::strftime_utc(&pattern, interval_time as i64)
            .map_err(|e| PluginError::OutputName(self.plugin, format!("{e:?}")))?;
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let file = File::create(&path)?;
        info!("plugin {}: writing output to {}", self.plugin, path.display());
        Ok(BufWriter::new(file))
    }

    /// Close the current output file. The next record begins a new one.
    pub(crate) fn rotate(&mut self) -> Result<(), PluginError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            debug!("plugin {}: rotated output", self.plugin);
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<(), PluginError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}
