//! Logging bootstrap.
//!
//! The `-l` CLI switch selects where the `tracing` output goes. Only the
//! binary installs a subscriber; library code just emits events.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;

use crate::args::LogMode;

const LOG_FILE: &str = "tracemill.log";

pub fn init(mode: LogMode) -> Result<(), io::Error> {
    match mode {
        LogMode::Terminal => {
            tracing_subscriber::fmt()
                .compact()
                .with_writer(io::stderr)
                .init();
        }
        LogMode::File => {
            let file = File::options().append(true).create(true).open(LOG_FILE)?;
            tracing_subscriber::fmt()
                .compact()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        LogMode::Syslog => {
            open_syslog();
            tracing_subscriber::fmt()
                .compact()
                .with_ansi(false)
                .without_time()
                .with_writer(SyslogMakeWriter)
                .init();
        }
        LogMode::Disabled => {}
    }
    Ok(())
}

fn open_syslog() {
    static IDENT: &[u8] = b"tracemill\0";
    unsafe {
        libc::openlog(
            IDENT.as_ptr().cast(),
            libc::LOG_PID,
            libc::LOG_DAEMON,
        );
    }
}

struct SyslogMakeWriter;

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine(Vec::new())
    }
}

/// Buffers one formatted event and forwards it to syslog(3) on drop.
struct SyslogLine(Vec<u8>);

impl io::Write for SyslogLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogLine {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.0);
        let trimmed = text.trim_end();
        if trimmed.is_empty() {
            return;
        }
        // interior NULs would truncate the message, strip them
        let sanitized: String = trimmed.chars().filter(|c| *c != '\0').collect();
        if let Ok(message) = CString::new(sanitized) {
            static FORMAT: &[u8] = b"%s\0";
            unsafe {
                libc::syslog(libc::LOG_INFO, FORMAT.as_ptr().cast(), message.as_ptr());
            }
        }
    }
}
