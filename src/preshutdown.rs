//! Background job that keeps the SCM informed while the service winds down after a
//! preshutdown notification.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::event_log::{EventLog, EVENT_ID};
use crate::service::ServiceStatus;
use crate::{Error, Result};

/// Timing of the preshutdown drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSettings {
    /// Time between two `StopPending` updates.
    pub interval: Duration,
    /// Number of `StopPending` updates sent before the drain completes.
    pub iterations: u32,
    /// Wait hint reported with every update. Must exceed `interval`.
    pub wait_hint: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        DrainSettings {
            interval: Duration::from_secs(1),
            iterations: 30,
            wait_hint: Duration::from_millis(3000),
        }
    }
}

/// A running preshutdown drain.
///
/// Completion is signalled by closing the channel returned from [`DrainJob::done`], so any
/// number of observers see it and it can't be signalled twice. Dropping the job cancels the
/// drain and waits for its thread to exit.
#[derive(Debug)]
pub struct DrainJob {
    checkpoint: Arc<AtomicU32>,
    done: Receiver<()>,
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DrainJob {
    /// Spawns the drain thread. Checkpoints reported by the drain start at `start_checkpoint`.
    pub fn start<L>(
        settings: DrainSettings,
        start_checkpoint: u32,
        status: Sender<ServiceStatus>,
        log: Arc<L>,
    ) -> Result<DrainJob>
    where
        L: EventLog + ?Sized + 'static,
    {
        let checkpoint = Arc::new(AtomicU32::new(start_checkpoint));
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);

        let thread_checkpoint = checkpoint.clone();
        let thread = thread::Builder::new()
            .name("preshutdown-drain".to_owned())
            .spawn(move || {
                // Held for the whole drain, dropping it is the completion signal.
                let _done = done_tx;
                drain(&settings, &thread_checkpoint, &status, &*log, &cancel_rx);
            })
            .map_err(Error::ThreadSpawn)?;

        Ok(DrainJob {
            checkpoint,
            done: done_rx,
            cancel: Some(cancel_tx),
            thread: Some(thread),
        })
    }

    /// Channel that gets disconnected once the drain has finished.
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }

    pub fn is_done(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// The checkpoint the next `StopPending` update should use.
    pub fn checkpoint(&self) -> u32 {
        self.checkpoint.load(Ordering::SeqCst)
    }

    /// Cancels the drain if it is still running, waits for the thread and returns the next
    /// checkpoint.
    pub fn stop(mut self) -> u32 {
        self.shutdown();
        self.checkpoint()
    }

    fn shutdown(&mut self) {
        self.cancel.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Preshutdown drain thread panicked");
            }
        }
    }
}

impl Drop for DrainJob {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain<L: EventLog + ?Sized>(
    settings: &DrainSettings,
    checkpoint: &AtomicU32,
    status: &Sender<ServiceStatus>,
    log: &L,
    cancel: &Receiver<()>,
) {
    log.info(EVENT_ID, "Preshutdown");
    for iteration in 1..=settings.iterations {
        let current = checkpoint.load(Ordering::SeqCst);
        let update = ServiceStatus::stop_pending(current, settings.wait_hint);
        if status.send(update).is_err() {
            log.error(EVENT_ID, "Preshutdown status channel closed");
            return;
        }

        let cancelled = match cancel.recv_timeout(settings.interval) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        };
        // Bumped even when cancelled so the final StopPending moves past the last update.
        checkpoint.fetch_add(1, Ordering::SeqCst);

        if cancelled {
            log.info(EVENT_ID, "Preshutdown cancelled");
            return;
        }
        if iteration == settings.iterations {
            log.info(EVENT_ID, "Preshutdown keep alive end");
        } else {
            log.info(EVENT_ID, "Preshutdown tick");
        }
    }
}
