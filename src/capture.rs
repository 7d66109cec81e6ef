//! Unbuffered capture of the target's standard output
//!
//! The target writes to the subordinate side of a pseudo-terminal instead of a
//! pipe. Most runtimes line-buffer stdout when it is a terminal, so lines reach
//! the supervisor as soon as they are printed. Output post-processing is turned
//! off so `\n` is not rewritten to `\r\n`.
//!
//! A plain pipe would also work for targets that flush every line themselves,
//! but gives no such guarantee in general.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::sys::termios::{tcgetattr, tcsetattr, OutputFlags, SetArg};
use nix::unistd::dup2_stdout;

use crate::error::{EmuError, Result};

/// Both ends of the capture terminal, before the target is forked
#[derive(Debug)]
pub struct CaptureChannel {
    controller: OwnedFd,
    subordinate: OwnedFd,
}

impl CaptureChannel {
    pub fn open() -> Result<Self> {
        let pty = openpty(None, None).map_err(|errno| EmuError::os("openpty", errno))?;

        match tcgetattr(&pty.slave) {
            Ok(mut termios) => {
                termios.output_flags.remove(OutputFlags::OPOST);
                if let Err(errno) = tcsetattr(&pty.slave, SetArg::TCSANOW, &termios) {
                    tracing::warn!("tcsetattr: {}", errno);
                }
            }
            Err(errno) => tracing::warn!("tcgetattr: {}", errno),
        }

        Ok(Self {
            controller: pty.master,
            subordinate: pty.slave,
        })
    }

    /// Child side: make the terminal the process's stdout and close both ends
    pub fn attach_stdout(self) -> Result<()> {
        dup2_stdout(&self.subordinate).map_err(|errno| EmuError::os("dup2", errno))?;
        drop(self);
        Ok(())
    }

    /// Parent side: keep the controlling end, non-blocking, for line reads
    pub fn into_reader(self) -> Result<CaptureReader> {
        let CaptureChannel {
            controller,
            subordinate,
        } = self;
        drop(subordinate);

        set_nonblocking(&controller)?;

        Ok(CaptureReader {
            reader: BufReader::new(File::from(controller)),
            pending: Vec::new(),
        })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|errno| EmuError::os("fcntl(F_GETFL)", errno))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|errno| EmuError::os("fcntl(F_SETFL)", errno))?;
    Ok(())
}

/// Lines read in one drain
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drain {
    /// Complete lines, each still carrying its `\n` (the last one may lack it on hang-up)
    pub lines: Vec<Vec<u8>>,
    /// The target closed the terminal; no more output will arrive
    pub hangup: bool,
}

/// Line-oriented, non-blocking reader over the controlling side
#[derive(Debug)]
pub struct CaptureReader<R = BufReader<File>> {
    reader: R,
    /// Bytes of a line whose terminator has not arrived yet
    pending: Vec<u8>,
}

impl<R: BufRead> CaptureReader<R> {
    /// Wrap an arbitrary buffered reader
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    /// Read every line that is available right now
    ///
    /// "No data yet" ends the drain and is not an error. A terminal hang-up
    /// (`EIO` on Linux) or end-of-file flushes a trailing partial line.
    pub fn drain(&mut self) -> Result<Drain> {
        let mut drain = Drain::default();

        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    drain.hangup = true;
                    break;
                }
                Ok(_) if self.pending.ends_with(b"\n") => {
                    drain.lines.push(std::mem::take(&mut self.pending));
                }
                // Data without a terminator means the reader hit end-of-file
                Ok(_) => {
                    drain.hangup = true;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                    drain.hangup = true;
                    break;
                }
                Err(e) => return Err(EmuError::Io(e)),
            }
        }

        if drain.hangup && !self.pending.is_empty() {
            drain.lines.push(std::mem::take(&mut self.pending));
        }

        Ok(drain)
    }
}

impl AsFd for CaptureReader<BufReader<File>> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.get_ref().as_fd()
    }
}
