//! An in-process host for the service controller.
//!
//! [`DebugHost`] plays the part of the SCM: it runs the control loop on its own thread,
//! keeps track of the last reported status and delivers controls with that status attached.
//! Useful for running the service from a console and for tests.

use std::ffi::OsString;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as channel, Receiver, Sender};

use crate::beep::Beeper;
use crate::controller::ServiceController;
use crate::event_log::EventLog;
use crate::service::{ControlRequest, ServiceControl, ServiceExitCode, ServiceStatus, SharedStatus};
use crate::{Error, Result};

/// Hosts a [`ServiceController`] on a background thread and forwards controls to it.
///
/// Controls are accepted until the control loop exits. [`DebugHost::wait`] does not stop the
/// loop, send `Stop` or `Shutdown` first unless a preshutdown drain is running.
pub struct DebugHost {
    requests: Sender<ControlRequest>,
    current_status: SharedStatus,
    updates: Receiver<ServiceStatus>,
    updates_tx: Sender<ServiceStatus>,
    service: JoinHandle<ServiceExitCode>,
    forwarder: JoinHandle<()>,
}

impl DebugHost {
    /// Starts the control loop of `controller` on a new thread.
    pub fn start<L, B>(
        arguments: Vec<OsString>,
        controller: ServiceController<L, B>,
    ) -> Result<DebugHost>
    where
        L: EventLog + ?Sized + 'static,
        B: Beeper + 'static,
    {
        let (request_tx, request_rx) = channel::unbounded();
        let (status_tx, status_rx) = channel::unbounded::<ServiceStatus>();
        let (updates_tx, updates_rx) = channel::unbounded();
        let current_status = SharedStatus::default();

        let forwarder_status = current_status.clone();
        let forwarder_updates = updates_tx.clone();
        let forwarder = thread::Builder::new()
            .name("debug-status".to_owned())
            .spawn(move || {
                for status in status_rx {
                    if status.current_state.is_pending() {
                        log::debug!(
                            "{:?} (checkpoint {}, wait hint {}ms)",
                            status.current_state,
                            status.checkpoint,
                            status.wait_hint_millis()
                        );
                    } else {
                        log::debug!("{:?}", status.current_state);
                    }
                    forwarder_status.set(status.clone());
                    let _ = forwarder_updates.send(status);
                }
            })
            .map_err(Error::ThreadSpawn)?;

        let service = thread::Builder::new()
            .name("debug-service".to_owned())
            .spawn(move || controller.execute(&arguments, request_rx, status_tx))
            .map_err(Error::ThreadSpawn)?;

        Ok(DebugHost {
            requests: request_tx,
            current_status,
            updates: updates_rx,
            updates_tx,
            service,
            forwarder,
        })
    }

    /// Delivers `command` to the control loop.
    ///
    /// Returns `false` when the control loop has already exited.
    pub fn control(&self, command: ServiceControl) -> bool {
        let request = ControlRequest::new(command, self.current_status());
        self.requests.send(request).is_ok()
    }

    /// The last status reported by the control loop.
    pub fn current_status(&self) -> ServiceStatus {
        self.current_status.get()
    }

    /// Every status reported by the control loop, in order, followed by `Stopped` once
    /// [`DebugHost::wait`] returns.
    pub fn updates(&self) -> &Receiver<ServiceStatus> {
        &self.updates
    }

    /// Whether the control loop has exited.
    pub fn is_finished(&self) -> bool {
        self.service.is_finished()
    }

    /// Waits for the control loop to exit and reports `Stopped` with its exit code.
    pub fn wait(self) -> Result<ServiceExitCode> {
        let DebugHost {
            requests,
            current_status,
            updates_tx,
            service,
            forwarder,
            ..
        } = self;

        // `requests` stays open until the loop exits so a running drain is not cut short.
        let exit_code = service.join().map_err(|_| Error::ThreadPanicked)?;
        drop(requests);
        forwarder.join().map_err(|_| Error::ThreadPanicked)?;

        let stopped = ServiceStatus::stopped(exit_code);
        log::debug!("{:?} ({:?})", stopped.current_state, exit_code);
        current_status.set(stopped.clone());
        let _ = updates_tx.send(stopped);
        Ok(exit_code)
    }
}
