//! Meta report writer
//!
//! Line-oriented `key:value` record of one run. Entries accumulate in memory
//! and reach the destination in a single flush once the outcome is known.
//! Until then the destination descriptor is published to the fatal-signal
//! path, which may still append a last-resort `status:XX` report.

use crate::config::types::{KeeperError, MetaDestination, Result};
use crate::core::types::ResourceUsage;
use crate::kernel::signal;
use crate::verdict::verdict::Outcome;
use log::warn;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaKey {
    Status,
    Message,
    Time,
    TimeWall,
    MaxRss,
    CswVoluntary,
    CswForced,
    ExitCode,
    ExitSig,
    Killed,
}

impl MetaKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaKey::Status => "status",
            MetaKey::Message => "message",
            MetaKey::Time => "time",
            MetaKey::TimeWall => "time-wall",
            MetaKey::MaxRss => "max-rss",
            MetaKey::CswVoluntary => "csw-voluntary",
            MetaKey::CswForced => "csw-forced",
            MetaKey::ExitCode => "exitcode",
            MetaKey::ExitSig => "exitsig",
            MetaKey::Killed => "killed",
        }
    }
}

enum MetaSink {
    Stdout,
    File(File),
}

impl MetaSink {
    fn raw_fd(&self) -> RawFd {
        match self {
            MetaSink::Stdout => libc::STDOUT_FILENO,
            MetaSink::File(file) => file.as_raw_fd(),
        }
    }
}

/// Format a duration as `S.mmm`
pub fn format_seconds(duration: Duration) -> String {
    let millis = duration.as_millis();
    format!("{}.{:03}", millis / 1000, millis % 1000)
}

pub struct MetaReport {
    sink: Option<MetaSink>,
    entries: Vec<(MetaKey, String)>,
    flushed: bool,
}

impl MetaReport {
    /// Open the destination right away so a bad path fails the run early.
    /// A file destination is created or truncated here.
    pub fn open(destination: &MetaDestination) -> Result<Self> {
        let sink = match destination {
            MetaDestination::None => None,
            MetaDestination::Stdout => Some(MetaSink::Stdout),
            MetaDestination::File(path) => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| {
                        KeeperError::Meta(format!("Failed to open meta file {}: {}", path.display(), e))
                    })?;
                Some(MetaSink::File(file))
            }
        };

        if let Some(sink) = &sink {
            signal::publish_meta_fd(sink.raw_fd());
        }

        Ok(Self {
            sink,
            entries: Vec::new(),
            flushed: false,
        })
    }

    /// Report that is kept in memory only
    pub fn disabled() -> Self {
        Self {
            sink: None,
            entries: Vec::new(),
            flushed: false,
        }
    }

    /// Append one entry. A key is only ever recorded once; repeats are dropped.
    pub fn record(&mut self, key: MetaKey, value: impl Display) {
        if self.get(key).is_some() {
            warn!("Meta key {} already recorded, ignoring new value", key.as_str());
            return;
        }
        let value = value.to_string().replace(['\n', '\r'], " ");
        self.entries.push((key, value));
    }

    pub fn get(&self, key: MetaKey) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Outcome detail, then status and message, then whether we killed the child
    pub fn record_outcome(&mut self, outcome: &Outcome, killed: bool) {
        if let Outcome::Violation(violation) = outcome {
            if let Some(code) = violation.exit_code() {
                self.record(MetaKey::ExitCode, code);
            }
            if let Some(sig) = violation.exit_signal() {
                self.record(MetaKey::ExitSig, sig);
            }
        }
        if let Some(status) = outcome.status() {
            self.record(MetaKey::Status, status);
        }
        if let Some(message) = outcome.message() {
            self.record(MetaKey::Message, message);
        }
        if killed {
            self.record(MetaKey::Killed, 1);
        }
    }

    pub fn record_usage(&mut self, usage: &ResourceUsage) {
        self.record(MetaKey::Time, format_seconds(usage.cpu_time));
        self.record(MetaKey::TimeWall, format_seconds(usage.wall_time));
        self.record(MetaKey::MaxRss, usage.max_rss_kb);
        self.record(MetaKey::CswVoluntary, usage.voluntary_switches);
        self.record(MetaKey::CswForced, usage.forced_switches);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key.as_str());
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Write the report out. Only the first call writes anything.
    pub fn flush(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;
        signal::retract_meta_fd();

        let rendered = self.render();
        match self.sink.as_mut() {
            None => Ok(()),
            Some(MetaSink::Stdout) => {
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(rendered.as_bytes())
                    .and_then(|_| stdout.flush())
                    .map_err(|e| KeeperError::Meta(format!("Failed to write meta report: {}", e)))
            }
            Some(MetaSink::File(file)) => file
                .write_all(rendered.as_bytes())
                .and_then(|_| file.flush())
                .map_err(|e| KeeperError::Meta(format!("Failed to write meta report: {}", e))),
        }
    }
}
