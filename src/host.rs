//! Runs a [`ServiceController`] under the Service Control Manager.

use std::ffi::{OsStr, OsString};
use std::thread;

use crossbeam_channel as channel;

use crate::beep::Beeper;
use crate::controller::ServiceController;
use crate::event_log::EventLog;
use crate::service::{ControlRequest, ServiceControl, ServiceExitCode, ServiceStatus, SharedStatus};
use crate::service_control_handler::{self, ServiceControlHandlerResult};
use crate::{Error, Result};

/// Serves `controller` as the service `service_name`.
///
/// Must be called from the `service_main` generated by
/// [`define_windows_service!`](crate::define_windows_service). Registers the control handler,
/// runs the control loop on the calling thread and reports `Stopped` with the controller's exit
/// code once the loop returns.
///
/// Every control is forwarded to the controller together with the last reported status.
/// Unknown controls are forwarded as well but answered with `ERROR_CALL_NOT_IMPLEMENTED`.
pub fn serve<L, B>(
    service_name: impl AsRef<OsStr>,
    arguments: Vec<OsString>,
    controller: ServiceController<L, B>,
) -> Result<ServiceExitCode>
where
    L: EventLog + ?Sized + 'static,
    B: Beeper,
{
    let (request_tx, request_rx) = channel::unbounded();
    let (status_tx, status_rx) = channel::unbounded::<ServiceStatus>();
    let current_status = SharedStatus::default();

    let handler_status = current_status.clone();
    let event_handler = move |control: ServiceControl| -> ServiceControlHandlerResult {
        let request = ControlRequest::new(control, handler_status.get());
        if request_tx.send(request).is_err() {
            log::debug!("Dropping {:?}, the control loop has exited", control);
        }
        match control {
            ServiceControl::Unknown(_) => ServiceControlHandlerResult::NotImplemented,
            _ => ServiceControlHandlerResult::NoError,
        }
    };
    let status_handle = service_control_handler::register(service_name, event_handler)?;

    let forwarder = thread::Builder::new()
        .name("service-status".to_owned())
        .spawn(move || {
            for status in status_rx {
                log::debug!(
                    "Reporting {:?} (checkpoint {}, wait hint {}ms)",
                    status.current_state,
                    status.checkpoint,
                    status.wait_hint_millis()
                );
                if let Err(e) = status_handle.set_service_status(&status) {
                    log::error!("Unable to report service status: {}", e);
                }
                current_status.set(status);
            }
        })
        .map_err(Error::ThreadSpawn)?;

    let exit_code = controller.execute(&arguments, request_rx, status_tx);
    forwarder.join().map_err(|_| Error::ThreadPanicked)?;

    status_handle.set_service_status(&ServiceStatus::stopped(exit_code))?;
    Ok(exit_code)
}
