use crate::state::ProcessRecord;
use machine::*;
use std::fmt;

/// What came of a service's readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Ready,
    /// The service declares no readiness endpoint.
    Assumed,
    TimedOut,
}

/// The aggregate verdict over one start pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Every service launched and became ready.
    Healthy,
    /// Something's running, but at least one service didn't launch or never became ready.
    Degraded,
    /// Not a single service launched.
    NothingStarted,
}

/// Everything a start pass has found out so far.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Progress {
    pub launched: Vec<ProcessRecord>,
    pub failed: Vec<String>,
    pub probes: Vec<(String, ProbeResult)>,
}

impl Progress {
    pub fn health(&self) -> Health {
        if self.launched.is_empty() {
            Health::NothingStarted
        } else if !self.failed.is_empty()
            || self.probes.len() < self.launched.len()
            || self
                .probes
                .iter()
                .any(|(_, result)| *result == ProbeResult::TimedOut)
        {
            Health::Degraded
        } else {
            Health::Healthy
        }
    }

    pub fn unhealthy(&self) -> Vec<&str> {
        self.failed
            .iter()
            .map(String::as_str)
            .chain(
                self.probes
                    .iter()
                    .filter(|(_, result)| *result == ProbeResult::TimedOut)
                    .map(|(name, _)| name.as_str()),
            )
            .collect()
    }
}

machine! {
    #[derive(Clone, PartialEq)]
    pub enum Session {
        Idle,
        Starting { progress: Progress },
        AwaitingReadiness { progress: Progress },
        Running { progress: Progress },
        Stopping,
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session::")?;
        let progress = match self {
            Session::Idle(_) => return write!(f, "Idle"),
            Session::Stopping(_) => return write!(f, "Stopping"),
            Session::Error => return write!(f, "Error"),
            Session::Starting(Starting { progress }) => {
                write!(f, "Starting")?;
                progress
            }
            Session::AwaitingReadiness(AwaitingReadiness { progress }) => {
                write!(f, "AwaitingReadiness")?;
                progress
            }
            Session::Running(Running { progress }) => {
                write!(f, "Running")?;
                progress
            }
        };
        write!(
            f,
            "(launched:{}, failed:{}, probed:{})",
            progress.launched.len(),
            progress.failed.len(),
            progress.probes.len()
        )
    }
}

methods!(Session, [
    Starting, AwaitingReadiness, Running => fn progress(&self) -> Progress
]);

#[derive(Clone, Debug, PartialEq)]
pub struct StartRequested;

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceLaunched(pub ProcessRecord);

#[derive(Clone, Debug, PartialEq)]
pub struct LaunchFailed(pub String);

/// The launched processes are on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchesRecorded;

/// Nothing launched, so there's nothing to record or wait for.
#[derive(Clone, Debug, PartialEq)]
pub struct NothingLaunched;

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceProbed(pub String, pub ProbeResult);

#[derive(Clone, Debug, PartialEq)]
pub struct ProbesFinished;

#[derive(Clone, Debug, PartialEq)]
pub struct StopRequested;

#[derive(Clone, Debug, PartialEq)]
pub struct StateCleared;

transitions!(Session, [
    (Idle, StartRequested) => Starting,
    (Idle, StopRequested) => Stopping,

    (Starting, ServiceLaunched) => Starting,
    (Starting, LaunchFailed) => Starting,
    (Starting, LaunchesRecorded) => AwaitingReadiness,
    (Starting, NothingLaunched) => Idle,
    (Starting, StopRequested) => Stopping,

    (AwaitingReadiness, ServiceProbed) => AwaitingReadiness,
    (AwaitingReadiness, ProbesFinished) => Running,
    (AwaitingReadiness, StopRequested) => Stopping,

    (Running, StopRequested) => Stopping,

    (Stopping, StateCleared) => Idle
]);

impl Idle {
    fn on_start_requested(self, _: StartRequested) -> Starting {
        Starting {
            progress: Progress::default(),
        }
    }

    fn on_stop_requested(self, _: StopRequested) -> Stopping {
        Stopping {}
    }
}

impl Starting {
    fn on_service_launched(self, ServiceLaunched(record): ServiceLaunched) -> Starting {
        let mut progress = self.progress;
        progress.launched.push(record);
        Starting { progress }
    }

    fn on_launch_failed(self, LaunchFailed(name): LaunchFailed) -> Starting {
        let mut progress = self.progress;
        progress.failed.push(name);
        Starting { progress }
    }

    fn on_launches_recorded(self, _: LaunchesRecorded) -> AwaitingReadiness {
        AwaitingReadiness {
            progress: self.progress,
        }
    }

    fn on_nothing_launched(self, _: NothingLaunched) -> Idle {
        Idle {}
    }

    fn on_stop_requested(self, _: StopRequested) -> Stopping {
        Stopping {}
    }

    fn progress(&self) -> Progress {
        self.progress.clone()
    }
}

impl AwaitingReadiness {
    fn on_service_probed(self, ServiceProbed(name, result): ServiceProbed) -> AwaitingReadiness {
        let mut progress = self.progress;
        progress.probes.push((name, result));
        AwaitingReadiness { progress }
    }

    fn on_probes_finished(self, _: ProbesFinished) -> Running {
        Running {
            progress: self.progress,
        }
    }

    fn on_stop_requested(self, _: StopRequested) -> Stopping {
        Stopping {}
    }

    fn progress(&self) -> Progress {
        self.progress.clone()
    }
}

impl Running {
    fn on_stop_requested(self, _: StopRequested) -> Stopping {
        Stopping {}
    }

    fn progress(&self) -> Progress {
        self.progress.clone()
    }
}

impl Stopping {
    fn on_state_cleared(self, _: StateCleared) -> Idle {
        Idle {}
    }
}

impl Session {
    pub fn new() -> Session {
        Session::Idle(Idle {})
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}
