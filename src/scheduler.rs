//! Single-threaded readiness loop
//!
//! Three sources feed one epoll set:
//! - a signalfd for `SIGCHLD` (target stopped / continued / exited)
//! - a timerfd for periodic sampling
//! - the capture terminal, when phase patterns are configured
//!
//! The loop waits for one ready source, drains it, and hands the result to the
//! [`Session`]. Nothing runs in signal-handler context: `SIGCHLD` stays blocked
//! and is only ever read from the signalfd.

use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::capture::CaptureReader;
use crate::error::{EmuError, Result};
use crate::session::{Flow, IntervalTimer, Session};
use crate::supervisor::{ChildEvent, ChildProcess};

const SIGNAL_TOKEN: u64 = 1;
const TIMER_TOKEN: u64 = 2;
const CAPTURE_TOKEN: u64 = 3;

/// Block `SIGCHLD` for the calling thread and return the blocked set
///
/// Must run before the target is forked so no notification is lost; the
/// child unblocks the same set before `exec`.
pub fn block_child_signals() -> Result<SigSet> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block()
        .map_err(|errno| EmuError::os("sigprocmask", errno))?;
    Ok(mask)
}

/// Descriptor delivering the signals in `mask`
pub fn signal_channel(mask: &SigSet) -> Result<SignalFd> {
    SignalFd::with_flags(mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(|errno| EmuError::os("signalfd", errno))
}

/// Periodic timer backed by a timerfd
#[derive(Debug)]
pub struct PeriodicTimer {
    fd: TimerFd,
    interval: Duration,
    armed: bool,
}

impl PeriodicTimer {
    /// A disarmed timer firing every `interval` once armed
    pub fn new(interval: Duration) -> Result<Self> {
        let fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|errno| EmuError::os("timerfd_create", errno))?;
        Ok(Self {
            fd,
            interval,
            armed: false,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl IntervalTimer for PeriodicTimer {
    fn arm(&mut self) -> Result<()> {
        self.fd
            .set(
                Expiration::Interval(TimeSpec::from_duration(self.interval)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|errno| EmuError::os("arm timer", errno))?;
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.fd
            .unset()
            .map_err(|errno| EmuError::os("disarm timer", errno))?;
        self.armed = false;
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn acknowledge(&mut self) -> Result<bool> {
        match self.fd.wait() {
            Ok(()) => Ok(true),
            Err(Errno::EAGAIN) => Ok(false),
            Err(errno) => Err(EmuError::os("read timer", errno)),
        }
    }
}

impl AsFd for PeriodicTimer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Owns every descriptor of a monitoring run until the target exits
pub struct EventLoop<W: Write> {
    epoll: Epoll,
    signals: SignalFd,
    capture: Option<CaptureReader>,
    session: Session<ChildProcess, PeriodicTimer, W>,
}

impl<W: Write> EventLoop<W> {
    pub fn new(
        signals: SignalFd,
        capture: Option<CaptureReader>,
        session: Session<ChildProcess, PeriodicTimer, W>,
    ) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|errno| EmuError::os("epoll_create", errno))?;

        epoll
            .add(&signals, EpollEvent::new(EpollFlags::EPOLLIN, SIGNAL_TOKEN))
            .map_err(|errno| EmuError::os("add signalfd to epoll", errno))?;

        if let Some(timer) = session.timer() {
            epoll
                .add(timer, EpollEvent::new(EpollFlags::EPOLLIN, TIMER_TOKEN))
                .map_err(|errno| EmuError::os("add timer to epoll", errno))?;
        }

        if let Some(reader) = &capture {
            epoll
                .add(reader, EpollEvent::new(EpollFlags::EPOLLIN, CAPTURE_TOKEN))
                .map_err(|errno| EmuError::os("add target stdout to epoll", errno))?;
        }

        Ok(Self {
            epoll,
            signals,
            capture,
            session,
        })
    }

    /// Run until the target exits, returning how it exited
    pub fn run(mut self) -> Result<ChildEvent> {
        self.session.begin()?;

        let exit = loop {
            let mut events = [EpollEvent::empty(); 1];
            match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(errno) => return Err(EmuError::os("epoll_wait", errno)),
            }

            match events[0].data() {
                SIGNAL_TOKEN => {
                    if let Some(exit) = self.on_signals()? {
                        break exit;
                    }
                }
                TIMER_TOKEN => self.session.on_timer()?,
                CAPTURE_TOKEN => self.on_capture()?,
                token => return Err(EmuError::UnexpectedEvent(token)),
            }
        };

        self.flush_capture()?;
        Ok(exit)
    }

    /// Drain the signalfd; returns the exit event once the target is gone
    fn on_signals(&mut self) -> Result<Option<ChildEvent>> {
        while let Some(info) = self
            .signals
            .read_signal()
            .map_err(|errno| EmuError::os("read siginfo", errno))?
        {
            if info.ssi_signo != Signal::SIGCHLD as u32 {
                tracing::warn!("unexpected signal {}", info.ssi_signo);
                continue;
            }

            for event in self.session.target_mut().poll_events()? {
                if self.session.on_child(event)? == Flow::Exit {
                    return Ok(Some(event));
                }
            }
        }
        Ok(None)
    }

    fn on_capture(&mut self) -> Result<()> {
        let Some(reader) = self.capture.as_mut() else {
            return Ok(());
        };
        let drain = reader.drain()?;

        for line in &drain.lines {
            self.session.on_line(line)?;
        }

        if drain.hangup {
            tracing::debug!("target closed its output");
            if let Some(reader) = self.capture.take() {
                self.epoll
                    .delete(&reader)
                    .map_err(|errno| EmuError::os("remove target stdout from epoll", errno))?;
            }
        }
        Ok(())
    }

    /// Echo whatever output is still buffered after the target exited
    fn flush_capture(&mut self) -> Result<()> {
        if let Some(mut reader) = self.capture.take() {
            for line in reader.drain()?.lines {
                self.session.echo(&line)?;
            }
        }
        Ok(())
    }
}
