use std::ffi::OsStr;
use std::io;
use std::os::raw::c_void;
use widestring::WideCString;
use windows_sys::Win32::{
    Foundation::{ERROR_CALL_NOT_IMPLEMENTED, NO_ERROR},
    System::Services,
};

use crate::service::{ServiceControl, ServiceStatus};
use crate::{Error, Result};

/// A struct that holds a unique token for updating the status of the corresponding service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceStatusHandle(Services::SERVICE_STATUS_HANDLE);

impl ServiceStatusHandle {
    /// Report the new service status to the system.
    pub fn set_service_status(&self, service_status: &ServiceStatus) -> Result<()> {
        let raw_service_status = service_status.to_raw();
        let result = unsafe { Services::SetServiceStatus(self.0, &raw_service_status) };
        if result == 0 {
            Err(Error::Winapi(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}

// Underlying SERVICE_STATUS_HANDLE is thread safe.
// See remarks section for more info:
// https://msdn.microsoft.com/en-us/library/windows/desktop/ms686241(v=vs.85).aspx
unsafe impl Send for ServiceStatusHandle {}
unsafe impl Sync for ServiceStatusHandle {}

/// Abstraction over the return value of service control handler.
///
/// See the "Return value" section of corresponding MSDN article for more info:
///
/// <https://msdn.microsoft.com/en-us/library/windows/desktop/ms683241(v=vs.85).aspx>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceControlHandlerResult {
    /// The control was accepted.
    NoError,
    /// The received control is not implemented.
    NotImplemented,
}

impl ServiceControlHandlerResult {
    pub fn to_raw(&self) -> u32 {
        match *self {
            ServiceControlHandlerResult::NoError => NO_ERROR,
            ServiceControlHandlerResult::NotImplemented => ERROR_CALL_NOT_IMPLEMENTED,
        }
    }
}

/// Register a closure for receiving service events.
///
/// Returns [`ServiceStatusHandle`] that can be used to report the service status back to the
/// system.
///
/// The closure is never released. The system may invoke the handler until the process
/// exits, including after the service has reported that it stopped.
pub fn register<F>(service_name: impl AsRef<OsStr>, event_handler: F) -> Result<ServiceStatusHandle>
where
    F: FnMut(ServiceControl) -> ServiceControlHandlerResult + 'static + Send,
{
    let service_name =
        WideCString::from_os_str(service_name).map_err(Error::InvalidServiceName)?;

    // Move closure to heap.
    let context: *mut F = Box::into_raw(Box::new(event_handler));

    let status_handle = unsafe {
        Services::RegisterServiceCtrlHandlerExW(
            service_name.as_ptr(),
            Some(service_control_handler::<F>),
            context as *mut c_void,
        )
    };

    if status_handle.is_null() {
        // Release the `event_handler` in case of an error.
        let _: Box<F> = unsafe { Box::from_raw(context) };
        Err(Error::Winapi(io::Error::last_os_error()))
    } else {
        Ok(ServiceStatusHandle(status_handle))
    }
}

/// Static service control handler
extern "system" fn service_control_handler<F>(
    control: u32,
    _event_type: u32,
    _event_data: *mut c_void,
    context: *mut c_void,
) -> u32
where
    F: FnMut(ServiceControl) -> ServiceControlHandlerResult,
{
    // Important: cast context to &mut F without taking ownership.
    let event_handler: &mut F = unsafe { &mut *(context as *mut F) };

    event_handler(ServiceControl::from_raw(control)).to_raw()
}
