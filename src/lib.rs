//! A supervisor for a local development setup.
//!
//! `start` launches a fixed list of services, each in its own session, writes their PIDs to
//! a PID file, waits for them to pass their readiness checks and then idles until it gets
//! SIGINT or SIGTERM, at which point it stops them all. `stop` does the stopping part from
//! a separate invocation, going only by the PID file.

use anyhow::{Context, Result};
use configuration::Config;
use futures::{future::FutureExt, select};
use launcher::ForkExec;
use readiness::RawHttpProbe;
use reaper::ChildExits;
use session::{Health, Progress};
use shutdown::Shutdown;
use slog_scope::{info, warn};
use state::ProcessRecord;
use supervisor::{Stopped, Supervisor};

pub mod configuration;
pub mod launcher;
pub mod readiness;
pub mod reaper;
pub mod session;
pub mod shutdown;
pub mod signals;
pub mod state;
pub mod supervisor;

fn supervisor_for(config: &Config) -> Supervisor<ForkExec, RawHttpProbe> {
    Supervisor::new(
        config.state_store(),
        ForkExec,
        RawHttpProbe::new(config.supervisor.probe_attempt_timeout),
        config.supervisor.clone(),
    )
}

fn report(progress: &Progress) {
    match progress.health() {
        Health::Healthy => info!("all services are running"; "count" => progress.launched.len()),
        Health::Degraded => {
            let unhealthy = progress.unhealthy();
            warn!("some services failed to start or become ready";
                  "running" => progress.launched.len(),
                  "unhealthy" => ?unhealthy)
        }
        Health::NothingStarted => warn!("no service could be started";
                                        "failed" => ?progress.failed),
    }
}

/// Waits for a shutdown request, logging any supervised service that exits meanwhile.
async fn hold(records: &[ProcessRecord], shutdown: &Shutdown, exits: &mut ChildExits) {
    loop {
        select! {
            _ = shutdown.requested().fuse() => return,
            exit = exits.next().fuse() => match exit {
                Ok(exit) => match records.iter().find(|r| r.pid == exit.pid()) {
                    Some(record) => warn!("service exited";
                                          "service" => &record.name,
                                          "pid" => exit.pid().as_raw(),
                                          "status" => %exit),
                    None => info!("reaped child"; "pid" => exit.pid().as_raw(), "status" => %exit),
                },
                Err(e) => {
                    warn!("failed to reap children, no longer watching for exits"; "error" => ?e);
                    shutdown.requested().await;
                    return;
                }
            },
        }
    }
}

/// Starts all configured services and keeps them running until SIGINT or SIGTERM arrives,
/// then stops them again.
pub async fn start(config: &Config) -> Result<()> {
    let (trigger, shutdown) = shutdown::channel();
    signals::forward_termination_signals(trigger)?;
    let mut exits = reaper::watch_child_exits().context("Could not set up child exit handler")?;
    let env = config.environment()?;

    let mut supervisor = supervisor_for(config);
    info!("starting services"; "count" => config.services.len());
    let progress = supervisor.start(&config.registry(), &env, &shutdown).await?;
    if !shutdown.is_requested() {
        report(&progress);
        if progress.health() == Health::NothingStarted {
            return Ok(());
        }
        hold(&progress.launched, &shutdown, &mut exits).await;
    }

    info!("initiating cleanup");
    stop_with(&mut supervisor).await
}

/// Stops the services recorded by a running (or crashed) `start`.
pub async fn stop(config: &Config) -> Result<()> {
    stop_with(&mut supervisor_for(config)).await
}

async fn stop_with(supervisor: &mut Supervisor<ForkExec, RawHttpProbe>) -> Result<()> {
    match supervisor.stop().await? {
        Stopped::NothingToStop => {}
        Stopped::Stopped(count) => info!("cleanup complete, all services stopped"; "count" => count),
    }
    Ok(())
}
