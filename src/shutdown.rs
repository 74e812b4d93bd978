//! A one-shot shutdown token, checked wherever the supervisor waits.
//!
//! Firing a [`Trigger`] (or dropping every one of them) closes the underlying channel, which
//! wakes every [`Shutdown`] clone at once and keeps them woken.

use async_channel::{bounded, Receiver, Sender};
use futures::{future::FutureExt, pin_mut, select, Future};
use smol::Timer;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[error("interrupted by a shutdown request")]
pub struct Interrupted;

#[derive(Debug, Clone)]
pub struct Trigger {
    sender: Sender<()>,
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: Receiver<()>,
}

pub fn channel() -> (Trigger, Shutdown) {
    let (sender, receiver) = bounded(1);
    (Trigger { sender }, Shutdown { receiver })
}

impl Trigger {
    /// Requests shutdown. Returns false if that had already happened.
    pub fn fire(&self) -> bool {
        self.sender.close()
    }
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Resolves once shutdown was requested.
    pub async fn requested(&self) {
        // Nothing is ever sent, so this only returns once the channel is closed.
        while self.receiver.recv().await.is_ok() {}
    }

    /// Runs `fut` to completion unless shutdown is requested first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        if self.is_requested() {
            return Err(Interrupted);
        }
        let fut = fut.fuse();
        let requested = self.requested().fuse();
        pin_mut!(fut, requested);
        select! {
            output = fut => Ok(output),
            _ = requested => Err(Interrupted),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.guard(Timer::after(duration)).await.map(drop)
    }
}
