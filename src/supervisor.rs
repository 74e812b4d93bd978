//! The lifecycle controller: launch → record → probe → report on start, and
//! terminate → wait → kill → forget on stop.

use crate::configuration::{Service, SupervisorConfig};
use crate::launcher::{ProcessControl, SignalFailure};
use crate::readiness::Readiness;
use crate::session::{
    LaunchFailed, LaunchesRecorded, NothingLaunched, ProbeResult, ProbesFinished, Progress,
    ServiceLaunched, ServiceProbed, Session, StartRequested, StateCleared, StopRequested,
};
use crate::shutdown::Shutdown;
use crate::state::{ProcessRecord, StateStore};
use anyhow::Result;
use nix::sys::signal::Signal;
use slog_scope::{crit, debug, info, warn};
use smol::Timer;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// A PID file is already there, so some other session is (or was) running.
#[derive(Error, Debug, PartialEq)]
#[error("found existing PID file {path:?}; stop the running services first")]
pub struct DoubleStart {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    NothingToStop,
    Stopped(usize),
}

pub struct Supervisor<P, R> {
    store: StateStore,
    control: P,
    probe: R,
    settings: SupervisorConfig,
    session: Session,
}

impl<P: ProcessControl, R: Readiness> Supervisor<P, R> {
    pub fn new(store: StateStore, control: P, probe: R, settings: SupervisorConfig) -> Self {
        Supervisor {
            store,
            control,
            probe,
            settings,
            session: Session::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn control(&self) -> &P {
        &self.control
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn advance(&mut self, transition: impl FnOnce(Session) -> Session) {
        let current = std::mem::replace(&mut self.session, Session::Error);
        self.session = transition(current);
        if let Session::Error = self.session {
            crit!("supervisor session reached an invalid state");
        }
    }

    fn progress(&self) -> Progress {
        self.session.progress().unwrap_or_default()
    }

    /// Launches every service, records what launched and waits for each of them to become
    /// ready.
    ///
    /// Individual services failing to launch or to become ready doesn't make this fail; the
    /// returned progress says what happened to each. If `shutdown` is requested during the
    /// settle delay or a readiness probe, this returns early and the caller is expected to
    /// stop what was launched.
    pub async fn start(
        &mut self,
        services: &[Service],
        env: &HashMap<String, String>,
        shutdown: &Shutdown,
    ) -> Result<Progress> {
        if self.store.exists() {
            return Err(DoubleStart {
                path: self.store.path().to_owned(),
            }
            .into());
        }
        self.advance(|s| s.on_start_requested(StartRequested));

        let mut launched = Vec::with_capacity(services.len());
        for service in services {
            info!("starting service"; "service" => &service.name, "port" => service.port);
            match self.control.launch(service, env) {
                Ok(record) => {
                    info!("launched service"; "service" => &record.name, "pid" => record.pid.as_raw());
                    launched.push(record.clone());
                    self.advance(|s| s.on_service_launched(ServiceLaunched(record)));
                }
                Err(e) => {
                    warn!("failed to launch service"; "service" => &service.name, "error" => %e);
                    let name = service.name.clone();
                    self.advance(|s| s.on_launch_failed(LaunchFailed(name)));
                }
            }
        }

        if launched.is_empty() {
            let progress = self.progress();
            self.advance(|s| s.on_nothing_launched(NothingLaunched));
            return Ok(progress);
        }
        if let Err(e) = self.store.write(&launched) {
            crit!("could not record launched services, stopping them again"; "error" => ?e);
            self.terminate(&launched).await;
            self.advance(|s| s.on_stop_requested(StopRequested));
            self.advance(|s| s.on_state_cleared(StateCleared));
            return Err(e);
        }
        self.advance(|s| s.on_launches_recorded(LaunchesRecorded));

        if shutdown.sleep(self.settings.settle_delay).await.is_err() {
            return Ok(self.progress());
        }

        for record in &launched {
            let endpoint = services
                .iter()
                .find(|service| service.name == record.name)
                .and_then(|service| service.readiness.as_ref());
            let result = match endpoint {
                None => {
                    info!("no readiness check, assuming started"; "service" => &record.name);
                    ProbeResult::Assumed
                }
                Some(endpoint) => {
                    info!("waiting for service to become ready";
                          "service" => &record.name, "endpoint" => %endpoint);
                    let probe = self.probe.await_ready(
                        endpoint,
                        self.settings.readiness_timeout,
                        self.settings.readiness_poll_interval,
                    );
                    match shutdown.guard(probe).await {
                        Err(_) => return Ok(self.progress()),
                        Ok(true) => {
                            info!("service is ready"; "service" => &record.name);
                            ProbeResult::Ready
                        }
                        Ok(false) => {
                            warn!("service did not become ready in time";
                                  "service" => &record.name,
                                  "timeout" => ?self.settings.readiness_timeout);
                            ProbeResult::TimedOut
                        }
                    }
                }
            };
            let name = record.name.clone();
            self.advance(|s| s.on_service_probed(ServiceProbed(name, result)));
        }
        self.advance(|s| s.on_probes_finished(ProbesFinished));
        Ok(self.progress())
    }

    /// Stops whatever the PID file lists, whether or not this supervisor launched it, and
    /// removes the PID file.
    pub async fn stop(&mut self) -> Result<Stopped> {
        self.advance(|s| s.on_stop_requested(StopRequested));
        let records = self.store.read();
        let outcome = if records.is_empty() {
            info!("no running services found to stop");
            Stopped::NothingToStop
        } else {
            info!("stopping services"; "count" => records.len());
            self.terminate(&records).await;
            Stopped::Stopped(records.len())
        };
        // An empty or garbled file would otherwise keep blocking the next start.
        self.store.clear()?;
        self.advance(|s| s.on_state_cleared(StateCleared));
        Ok(outcome)
    }

    /// SIGTERM in reverse launch order, a grace period, then SIGKILL for anything left.
    async fn terminate(&mut self, records: &[ProcessRecord]) {
        for record in records.iter().rev() {
            match self.control.signal(record.pid, Signal::SIGTERM) {
                Ok(()) => {
                    info!("sent SIGTERM"; "service" => &record.name, "pid" => record.pid.as_raw())
                }
                Err(SignalFailure::Gone) => {
                    info!("process not found, already terminated";
                          "service" => &record.name, "pid" => record.pid.as_raw())
                }
                Err(e) => {
                    warn!("error terminating service";
                          "service" => &record.name, "pid" => record.pid.as_raw(), "error" => %e)
                }
            }
        }

        Timer::after(self.settings.grace_period).await;

        for record in records {
            if let Err(e) = self.control.signal(record.pid, Signal::SIGKILL) {
                debug!("SIGKILL not delivered"; "service" => &record.name, "error" => %e);
            }
        }
    }
}
