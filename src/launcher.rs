use crate::configuration::Service;
use crate::state::ProcessRecord;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchFailure {
    /// The executable isn't installed or isn't on `$PATH`.
    #[error("command {0:?} not found, check that it is installed")]
    CommandNotFound(String),

    #[error("failed to launch: {0}")]
    LaunchError(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum SignalFailure {
    /// Nothing answers to that PID any more.
    #[error("no such process")]
    Gone,

    #[error("could not deliver signal: {0}")]
    Failed(#[source] nix::Error),
}

/// Starts services and signals them by PID. The PID is the only handle: a `stop`
/// invocation has nothing else to go on.
pub trait ProcessControl {
    /// Launches `service` with `env` layered on top of the current environment. Returns as
    /// soon as the process exists, without waiting for it to do anything.
    fn launch(
        &mut self,
        service: &Service,
        env: &HashMap<String, String>,
    ) -> Result<ProcessRecord, LaunchFailure>;

    /// Sends `signal` to the process group led by `pid`.
    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<(), SignalFailure>;
}

/// Launches each service as the leader of its own session, so that a signal hitting the
/// supervisor's terminal doesn't also reach the services, and so that a whole service
/// process tree can be signalled through its leader's PID.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkExec;

impl ProcessControl for ForkExec {
    fn launch(
        &mut self,
        service: &Service,
        env: &HashMap<String, String>,
    ) -> Result<ProcessRecord, LaunchFailure> {
        let mut cmdline = service.cmd.iter();
        let program = cmdline.next().ok_or_else(|| {
            LaunchFailure::LaunchError(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty commandline",
            ))
        })?;
        // A missing cwd makes spawn fail with NotFound, which would look like a missing
        // command.
        if !service.dir.is_dir() {
            return Err(LaunchFailure::LaunchError(io::Error::new(
                io::ErrorKind::NotFound,
                format!("working directory {:?} does not exist", service.dir),
            )));
        }

        let mut command = Command::new(program);
        command
            .args(cmdline)
            .current_dir(&service.dir)
            .envs(env)
            .stdin(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                setsid()
                    .map(|_| ())
                    .map_err(|_| io::Error::last_os_error())
            });
        }

        let child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LaunchFailure::CommandNotFound(program.to_string()),
            _ => LaunchFailure::LaunchError(e),
        })?;
        let pid = i32::try_from(child.id()).map_err(|_| {
            LaunchFailure::LaunchError(io::Error::new(
                io::ErrorKind::Other,
                format!("PID {} out of range", child.id()),
            ))
        })?;
        Ok(ProcessRecord::new(&service.name, Pid::from_raw(pid)))
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<(), SignalFailure> {
        match killpg(pid, signal) {
            Ok(()) => Ok(()),
            Err(nix::Error::Sys(Errno::ESRCH)) => Err(SignalFailure::Gone),
            Err(e) => Err(SignalFailure::Failed(e)),
        }
    }
}
