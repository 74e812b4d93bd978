use crate::shutdown::Trigger;
use anyhow::{Context, Result};
use slog_scope::{info, warn};
use smol::{Async, Task};
use std::{io::Read, os::unix::net::UnixStream};

/// Turns SIGINT and SIGTERM into a shutdown request on `trigger`.
///
/// The handlers stay installed afterwards, so a second signal during shutdown doesn't kill
/// the supervisor halfway through stopping its services.
pub fn forward_termination_signals(trigger: Trigger) -> Result<()> {
    let (read, write) =
        UnixStream::pair().context("Could not initialize signal handler socket pair")?;
    for &signal in &[signal_hook::SIGINT, signal_hook::SIGTERM] {
        let write = write
            .try_clone()
            .context("Could not duplicate signal handler socket")?;
        signal_hook::pipe::register(signal, write)
            .with_context(|| format!("registering handler for signal {}", signal))?;
    }
    let mut socket = Async::new(read)?;

    Task::spawn(async move {
        let mut buf = [0u8; 32];
        loop {
            match socket.read_with_mut(|io| io.read(&mut buf)).await {
                Ok(_) if trigger.fire() => info!("received termination signal, shutting down"),
                Ok(_) => info!("received termination signal, already shutting down"),
                Err(e) => {
                    warn!("failed to read from signal notification pipe"; "error" => %e);
                    trigger.fire();
                    return;
                }
            }
        }
    })
    .detach();
    Ok(())
}
