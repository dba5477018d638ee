//! CPU time sources for the keeper's periodic poll.
//!
//! The poll is only an early-kill heuristic: authoritative CPU time comes from
//! `wait4` rusage once the child is reaped.

use crate::config::types::{KeeperError, Result};
use nix::unistd::{sysconf, Pid, SysconfVar};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

/// Approximate CPU time of a still-running child
pub trait CpuTimeSource {
    fn source_name(&self) -> &str;
    fn cpu_time(&mut self, pid: Pid) -> Result<Duration>;
}

/// Reads utime + stime from `/proc/<pid>/stat`.
///
/// The file is opened on first use and re-read from offset 0 on every tick.
/// A zombie keeps its entry until we reap it, so the race with exit is benign.
pub struct ProcStatSource {
    ticks_per_sec: u64,
    stat_file: Option<File>,
}

impl ProcStatSource {
    pub fn new() -> Result<Self> {
        let ticks = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as u64,
            _ => return Err(KeeperError::Timing("Invalid ticks_per_sec!".to_string())),
        };
        Ok(Self {
            ticks_per_sec: ticks,
            stat_file: None,
        })
    }

    fn read_stat(&mut self, pid: Pid) -> Result<String> {
        if self.stat_file.is_none() {
            let path = format!("/proc/{}/stat", pid);
            let file = File::open(&path)
                .map_err(|e| KeeperError::Timing(format!("open({}): {}", path, e)))?;
            self.stat_file = Some(file);
        }

        let mut content = String::new();
        if let Some(file) = self.stat_file.as_mut() {
            file.seek(SeekFrom::Start(0))
                .and_then(|_| file.read_to_string(&mut content))
                .map_err(|e| KeeperError::Timing(format!("read on /proc/$pid/stat: {}", e)))?;
        }
        Ok(content)
    }
}

impl CpuTimeSource for ProcStatSource {
    fn source_name(&self) -> &str {
        "procfs"
    }

    fn cpu_time(&mut self, pid: Pid) -> Result<Duration> {
        let content = self.read_stat(pid)?;
        parse_proc_stat(&content, self.ticks_per_sec)
    }
}

/// Parse utime + stime out of a `/proc/<pid>/stat` line.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_proc_stat(content: &str, ticks_per_sec: u64) -> Result<Duration> {
    if ticks_per_sec == 0 {
        return Err(KeeperError::Timing("Invalid ticks_per_sec!".to_string()));
    }

    let open = content
        .find('(')
        .ok_or_else(|| KeeperError::Timing("proc stat syntax error 1".to_string()))?;
    let close = content
        .rfind(')')
        .filter(|&close| close > open)
        .ok_or_else(|| KeeperError::Timing("proc stat syntax error 1".to_string()))?;

    // state ppid pgrp session tty_nr tpgid flags minflt cminflt majflt cmajflt utime stime
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let parse_field = |idx: usize| -> Result<u64> {
        fields
            .get(idx)
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| KeeperError::Timing("proc stat syntax error 2".to_string()))
    };
    let utime = parse_field(11)?;
    let stime = parse_field(12)?;

    let ticks = utime + stime;
    Ok(Duration::from_millis(ticks * 1000 / ticks_per_sec))
}

/// Fallback for hosts without procfs: wall time elapsed since fork.
///
/// For a single-threaded program this is an upper bound of its CPU time, so
/// a CPU limit still kills a runaway loop, possibly early for programs that
/// sleep. The exit-time check stays exact either way.
pub struct WallClockEstimate {
    started: Instant,
}

impl WallClockEstimate {
    pub fn new(started: Instant) -> Self {
        Self { started }
    }
}

impl CpuTimeSource for WallClockEstimate {
    fn source_name(&self) -> &str {
        "wall-clock-estimate"
    }

    fn cpu_time(&mut self, _pid: Pid) -> Result<Duration> {
        Ok(self.started.elapsed())
    }
}

/// Pick the best CPU time source this host offers
pub fn detect_cpu_time_source(started: Instant) -> Result<Box<dyn CpuTimeSource>> {
    let source: Box<dyn CpuTimeSource> = if Path::new("/proc/self/stat").exists() {
        Box::new(ProcStatSource::new()?)
    } else {
        log::warn!("procfs unavailable; CPU time is estimated from wall clock while running");
        Box::new(WallClockEstimate::new(started))
    };
    log::debug!("CPU time source: {}", source.source_name());
    Ok(source)
}
