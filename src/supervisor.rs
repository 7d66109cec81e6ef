//! Target process launch and lifecycle tracking
//!
//! The target is forked and exec'd the same way a tracer starts its tracee,
//! except that the child installs a NUMA placement and optionally redirects
//! stdout into the capture terminal before replacing its image.

use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::capture::{CaptureChannel, CaptureReader};
use crate::error::{EmuError, Result};
use crate::placement::Placement;
use crate::stats::{HotnessSample, ProcTarget, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Stopped,
    Exited,
}

/// A state change of the target reported through `SIGCHLD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    Stopped,
    Continued,
    Exited(i32),
    Signaled(Signal),
}

impl ChildEvent {
    pub fn is_exit(&self) -> bool {
        matches!(self, ChildEvent::Exited(_) | ChildEvent::Signaled(_))
    }
}

/// What the child does between `fork` and `exec`
#[derive(Debug, Default)]
pub struct LaunchOptions {
    pub placement: Option<Placement>,
    pub capture: Option<CaptureChannel>,
    /// Signals blocked in the supervisor that must be unblocked in the target
    pub unblock: Option<SigSet>,
}

/// A freshly started target
#[derive(Debug)]
pub struct Launched {
    pub pid: Pid,
    /// Controlling side of the capture terminal, if one was requested
    pub capture: Option<CaptureReader>,
}

/// Fork and exec `command`
///
/// Exec failures are reported by the child itself, which then exits with 1.
pub fn launch(command: &[String], options: LaunchOptions) -> Result<Launched> {
    if command.is_empty() {
        return Err(EmuError::EmptyCommand);
    }

    // SAFETY: the supervisor is single-threaded at this point
    match unsafe { fork() }.map_err(|errno| EmuError::os("fork", errno))? {
        ForkResult::Parent { child } => {
            tracing::debug!(pid = child.as_raw(), program = %command[0], "target started");
            let capture = options
                .capture
                .map(CaptureChannel::into_reader)
                .transpose()?;
            Ok(Launched {
                pid: child,
                capture,
            })
        }
        ForkResult::Child => {
            let err = prepare_child(options)
                .map(|()| Command::new(&command[0]).args(&command[1..]).exec());
            match err {
                Ok(exec_err) => eprintln!("emu: exec target '{}': {}", command[0], exec_err),
                Err(setup_err) => eprintln!("emu: child setup: {}", setup_err),
            }
            std::process::exit(1);
        }
    }
}

fn prepare_child(options: LaunchOptions) -> Result<()> {
    if let Some(mask) = options.unblock {
        mask.thread_unblock()
            .map_err(|errno| EmuError::os("sigprocmask", errno))?;
    }
    if let Some(placement) = options.placement {
        placement.apply()?;
    }
    if let Some(capture) = options.capture {
        capture.attach_stdout()?;
    }
    Ok(())
}

/// The supervised target, owned exclusively by the supervisor
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    state: LifecycleState,
    target: ProcTarget,
}

impl ChildProcess {
    pub fn new(target: ProcTarget) -> Self {
        Self {
            pid: target.pid(),
            state: LifecycleState::Running,
            target,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Record a status reported by `waitpid`
    pub fn observe(&mut self, status: WaitStatus) -> Option<ChildEvent> {
        let event = match status {
            WaitStatus::Stopped(_, _) => ChildEvent::Stopped,
            WaitStatus::Continued(_) => ChildEvent::Continued,
            WaitStatus::Exited(_, code) => ChildEvent::Exited(code),
            WaitStatus::Signaled(_, sig, _) => ChildEvent::Signaled(sig),
            _ => return None,
        };
        self.state = match event {
            ChildEvent::Stopped => LifecycleState::Stopped,
            ChildEvent::Continued => LifecycleState::Running,
            ChildEvent::Exited(_) | ChildEvent::Signaled(_) => LifecycleState::Exited,
        };
        Some(event)
    }

    /// Collect every pending state change without blocking
    ///
    /// `SIGCHLD` notifications coalesce, so one notification may stand for
    /// several changes.
    pub fn poll_events(&mut self) -> Result<Vec<ChildEvent>> {
        let mut events = Vec::new();
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;

        while self.state != LifecycleState::Exited {
            let status = waitpid(self.pid, Some(flags)).map_err(|errno| EmuError::os("waitpid", errno))?;
            if status == WaitStatus::StillAlive {
                break;
            }
            if let Some(event) = self.observe(status) {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Send `SIGCONT`
    pub fn resume(&self) -> Result<()> {
        kill(self.pid, Signal::SIGCONT).map_err(|errno| EmuError::os("kill(SIGCONT)", errno))
    }

    pub fn sample_locality(&self) -> Result<Sample> {
        self.target.sample_locality()
    }

    pub fn sample_hotness(&self) -> Result<HotnessSample> {
        self.target.sample_hotness()
    }

    pub fn reset_hotness_tracking(&self) -> Result<()> {
        self.target.reset_hotness_tracking()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::placement::{NodeTopology, PlacementPolicy};

    fn target_of(pid: i32) -> ProcTarget {
        ProcTarget::new(Pid::from_raw(pid), MonotonicClock::start()).unwrap()
    }

    #[test]
    fn test_launch_requires_nonempty_command() {
        let result = launch(&[], LaunchOptions::default());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_observe_transitions() {
        let pid = Pid::from_raw(1234);
        let mut child = ChildProcess::new(target_of(1234));
        assert_eq!(child.state(), LifecycleState::Running);

        let ev = child.observe(WaitStatus::Stopped(pid, Signal::SIGSTOP));
        assert_eq!(ev, Some(ChildEvent::Stopped));
        assert_eq!(child.state(), LifecycleState::Stopped);

        let ev = child.observe(WaitStatus::Continued(pid));
        assert_eq!(ev, Some(ChildEvent::Continued));
        assert_eq!(child.state(), LifecycleState::Running);

        let ev = child.observe(WaitStatus::Exited(pid, 3));
        assert_eq!(ev, Some(ChildEvent::Exited(3)));
        assert!(ev.unwrap().is_exit());
        assert_eq!(child.state(), LifecycleState::Exited);
    }

    #[test]
    fn test_observe_ignores_still_alive() {
        let mut child = ChildProcess::new(target_of(1234));
        assert_eq!(child.observe(WaitStatus::StillAlive), None);
        assert_eq!(child.state(), LifecycleState::Running);
    }

    #[test]
    fn test_launch_and_reap_true() {
        let pid = launch(&["true".to_string()], LaunchOptions::default())
            .unwrap()
            .pid;
        let mut child = ChildProcess::new(target_of(pid.as_raw()));
        let mut events = Vec::new();
        for _ in 0..200 {
            events.extend(child.poll_events().unwrap());
            if child.state() == LifecycleState::Exited {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(events.last(), Some(&ChildEvent::Exited(0)));
    }

    #[test]
    fn test_exec_failure_exits_one() {
        let pid = launch(
            &["/nonexistent/definitely-not-a-program".to_string()],
            LaunchOptions::default(),
        )
        .unwrap()
        .pid;
        let status = waitpid(pid, None).unwrap();
        assert_eq!(status, WaitStatus::Exited(pid, 1));
    }

    #[test]
    fn test_launch_with_capture_relays_stdout() {
        let options = LaunchOptions {
            capture: Some(CaptureChannel::open().unwrap()),
            ..Default::default()
        };
        let launched = launch(&["echo".to_string(), "captured".to_string()], options).unwrap();
        let mut reader = launched.capture.unwrap();

        let mut lines = Vec::new();
        for _ in 0..200 {
            lines.extend(reader.drain().unwrap().lines);
            if !lines.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        waitpid(launched.pid, None).unwrap();
        assert_eq!(lines, vec![b"captured\n".to_vec()]);
    }

    #[test]
    fn test_interleave_placement_survives_exec() {
        if !std::path::Path::new("/proc/self/numa_maps").exists() {
            return;
        }
        let placement = PlacementPolicy::Interleave
            .resolve(&NodeTopology::system())
            .unwrap();
        let options = LaunchOptions {
            placement: Some(placement),
            capture: Some(CaptureChannel::open().unwrap()),
            ..Default::default()
        };
        let command = ["sh", "-c", "grep -m1 interleave: /proc/self/numa_maps"]
            .map(String::from);
        let launched = launch(&command, options).unwrap();
        let mut reader = launched.capture.unwrap();

        let mut lines = Vec::new();
        for _ in 0..200 {
            let drain = reader.drain().unwrap();
            lines.extend(drain.lines);
            if !lines.is_empty() || drain.hangup {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let status = waitpid(launched.pid, None).unwrap();
        assert_eq!(status, WaitStatus::Exited(launched.pid, 0));
        assert_eq!(lines.len(), 1);
        assert!(String::from_utf8_lossy(&lines[0]).contains("interleave:"));
    }
}
