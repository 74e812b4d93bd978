use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use slog_scope::debug;
use smol::Async;
use std::fmt;
use std::{io::Read, os::unix::net::UnixStream};

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(Pid, i32),
    Signal(Pid, Signal),
}

impl Exit {
    pub fn pid(&self) -> Pid {
        match self {
            Exit::Code(pid, _) | Exit::Signal(pid, _) => *pid,
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Code(_, code) => write!(f, "exit status {}", code),
            Exit::Signal(_, signal) => write!(f, "killed by {:?}", signal),
        }
    }
}

/// Sets up a SIGCHLD handler that wakes up a [`ChildExits`] whenever a child process might
/// be ready to be reaped.
pub fn watch_child_exits() -> Result<ChildExits> {
    let (read, write) =
        UnixStream::pair().context("Could not initialize signal handler socket pair")?;
    signal_hook::pipe::register(signal_hook::SIGCHLD, write)
        .context("registering sigchld handler")?;
    Ok(ChildExits {
        socket: Async::new(read)?,
    })
}

pub struct ChildExits {
    socket: Async<UnixStream>,
}

impl ChildExits {
    /// Reaps the next child process that exits.
    pub async fn next(&mut self) -> Result<Exit> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => return Ok(Exit::Code(pid, code)),
                Ok(WaitStatus::Signaled(pid, signal, _)) => return Ok(Exit::Signal(pid, signal)),

                // nothing to reap (yet), or no children at all:
                Ok(WaitStatus::StillAlive) | Err(nix::Error::Sys(Errno::ECHILD)) => {}

                Err(e) => return Err(e.into()),

                Ok(other) => {
                    debug!("ignoring child status change"; "change" => ?other);
                    continue;
                }
            }

            let mut buf = [0u8; 256];
            self.socket
                .read_with_mut(|io| io.read(&mut buf))
                .await
                .context("Failed to read from child exit notification pipe")?;
        }
    }
}
