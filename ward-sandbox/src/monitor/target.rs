//! Monitor targets: OS processes and in-process evaluations

use super::{MonitorTarget, ResourceSample};
use crate::interpreter::{InterpreterControl, InterruptReason};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A child process, observed through `/proc`
#[derive(Debug, Clone)]
pub struct ProcessTarget {
    pid: u32,
    /// Kill the whole process group rather than just `pid`
    group: bool,
    clock_ticks: u64,
}

impl ProcessTarget {
    pub fn new(pid: u32) -> Self {
        // SAFETY: sysconf has no preconditions
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            pid,
            group: false,
            clock_ticks: u64::try_from(ticks).ok().filter(|t| *t > 0).unwrap_or(100),
        }
    }

    /// Treat `pid` as the leader of its own process group
    pub fn with_process_group(mut self) -> Self {
        self.group = true;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn proc_path(&self, entry: &str) -> PathBuf {
        PathBuf::from(format!("/proc/{}/{}", self.pid, entry))
    }

    /// User plus system CPU time, `None` for a zombie or missing process
    fn cpu_time(&self) -> Option<Duration> {
        let stat = std::fs::read_to_string(self.proc_path("stat")).ok()?;
        // the command name may contain spaces; fields resume after the last ')'
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.first().copied() == Some("Z") {
            return None;
        }
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        let ticks = utime + stime;
        Some(Duration::from_millis(ticks * 1000 / self.clock_ticks))
    }

    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string(self.proc_path("status")).ok()?;
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kib * 1024)
    }

    fn open_files(&self) -> Option<u64> {
        let entries = std::fs::read_dir(self.proc_path("fd")).ok()?;
        Some(entries.count() as u64)
    }
}

impl MonitorTarget for ProcessTarget {
    fn sample(&self) -> Option<ResourceSample> {
        let cpu_time = self.cpu_time()?;
        Some(ResourceSample {
            cpu_time,
            memory_bytes: self.resident_bytes().unwrap_or(0),
            open_files: self.open_files().unwrap_or(0),
        })
    }

    fn terminate(&self) {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return;
        };
        let target = if self.group { -pid } else { pid };
        // SAFETY: sending a signal has no memory-safety preconditions
        unsafe {
            libc::kill(target, libc::SIGKILL);
        }
    }

    fn describe(&self) -> String {
        format!("process {}", self.pid)
    }
}

/// An evaluation running on an interpreter thread
#[derive(Debug, Clone)]
pub struct InterpreterTarget {
    control: Arc<InterpreterControl>,
}

impl InterpreterTarget {
    pub fn new(control: Arc<InterpreterControl>) -> Self {
        Self { control }
    }
}

impl MonitorTarget for InterpreterTarget {
    fn sample(&self) -> Option<ResourceSample> {
        if self.control.is_finished() {
            return None;
        }
        Some(ResourceSample {
            cpu_time: self.control.cpu_time(),
            memory_bytes: self.control.memory_bytes(),
            open_files: 0,
        })
    }

    fn terminate(&self) {
        self.control.interrupt(InterruptReason::ResourceExceeded);
    }

    fn describe(&self) -> String {
        "in-process evaluation".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreter_target_reports_until_finished() {
        let control = Arc::new(InterpreterControl::new());
        let target = InterpreterTarget::new(control.clone());
        let sample = target.sample().unwrap();
        assert_eq!(sample.open_files, 0);

        target.terminate();
        assert!(control.is_interrupted());
        assert_eq!(control.reason(), Some(InterruptReason::ResourceExceeded));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_target_samples_self() {
        let target = ProcessTarget::new(std::process::id());
        let sample = target.sample().unwrap();
        assert!(sample.memory_bytes > 0);
        assert!(sample.open_files > 0);
    }

    #[test]
    fn test_missing_process_is_gone() {
        // pid_max never reaches this value
        let target = ProcessTarget::new(u32::MAX - 1);
        assert!(target.sample().is_none());
    }
}
