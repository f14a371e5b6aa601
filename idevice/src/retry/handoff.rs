//! Unbuffered transfer of a replacement pair to a blocked caller

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::{oneshot, Notify};

use super::AfcPair;
use crate::pairing_file::PairingFile;
use crate::{IdeviceError, RetryOptions};

/// Rendezvous between the caller waiting in Draining and a supervisor.
/// Nothing is buffered: a pair is only accepted while someone waits for it.
#[derive(Debug, Default)]
pub(crate) struct Handoff {
    /// Set from the moment the connection is given up until a replacement lands
    draining: AtomicBool,
    waiting: Mutex<Option<oneshot::Sender<AfcPair>>>,
    arrived: Notify,
}

impl Handoff {
    fn slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<AfcPair>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    /// Blocks until a supervisor hands over a pair
    pub(crate) async fn wait(&self) -> AfcPair {
        loop {
            let (tx, rx) = oneshot::channel();
            *self.slot() = Some(tx);
            self.arrived.notify_one();
            if let Ok(pair) = rx.await {
                return pair;
            }
        }
    }

    /// Gives `pair` to a waiting caller, waiting up to `timeout` for one to
    /// show up. Returns the pair if nobody took it.
    pub(crate) async fn offer(
        &self,
        mut pair: AfcPair,
        timeout: std::time::Duration,
    ) -> Result<(), AfcPair> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let taker = self.slot().take();
            if let Some(tx) = taker {
                match tx.send(pair) {
                    Ok(()) => return Ok(()),
                    // the caller stopped waiting
                    Err(returned) => pair = returned,
                }
                continue;
            }
            if tokio::time::timeout_at(deadline, self.arrived.notified())
                .await
                .is_err()
            {
                return Err(pair);
            }
        }
    }
}

/// What became of a pair offered through [`Giver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveOutcome {
    /// Nobody was waiting, so no connection was made
    NotDraining,
    Delivered,
    /// Nobody accepted the pair in time; it was closed
    Discarded,
}

/// Supervisor side of a [`RetryConnection`](super::RetryConnection).
///
/// Clone it into whatever notices the device coming back and call
/// [`Giver::give`] from there.
#[derive(Debug, Clone)]
pub struct Giver {
    handoff: Arc<Handoff>,
    options: RetryOptions,
}

impl Giver {
    pub(crate) fn new(handoff: Arc<Handoff>, options: RetryOptions) -> Self {
        Self { handoff, options }
    }

    /// Whether the connection has given up its pair and wants a replacement.
    /// True as soon as the old pair starts tearing down, possibly before the
    /// caller is parked; [`Giver::hand_off`] waits for it.
    pub fn is_draining(&self) -> bool {
        self.handoff.is_draining()
    }

    /// Connects a fresh pair to `host` and hands it over. Does nothing unless
    /// the connection is draining.
    pub async fn give(
        &self,
        host: &str,
        pairing: &PairingFile,
    ) -> Result<GiveOutcome, IdeviceError> {
        if !self.is_draining() {
            debug!("RETRY: give ignored, connection is live");
            return Ok(GiveOutcome::NotDraining);
        }
        let pair = AfcPair::connect(host, pairing, &self.options.connect).await?;
        Ok(self.hand_off(pair).await)
    }

    /// Hands over an already connected pair. Closes it if no caller takes it
    /// within the give timeout.
    pub async fn hand_off(&self, pair: AfcPair) -> GiveOutcome {
        match self.handoff.offer(pair, self.options.give_timeout).await {
            Ok(()) => {
                info!("RETRY: handed over new connection");
                GiveOutcome::Delivered
            }
            Err(pair) => {
                warn!("RETRY: give timed out, discarding connection");
                pair.close().await;
                GiveOutcome::Discarded
            }
        }
    }
}
