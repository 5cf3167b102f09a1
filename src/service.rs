use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Raw `ERROR_SERVICE_SPECIFIC_ERROR` value.
const ERROR_SERVICE_SPECIFIC_ERROR: u32 = 1066;

/// Enum describing the service control operations.
///
/// Codes the service does not know about are kept as [`ServiceControl::Unknown`] so that the
/// control loop can report them instead of the host silently dropping them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceControl {
    Continue,
    Interrogate,
    Pause,
    Preshutdown,
    Shutdown,
    Stop,
    Unknown(u32),
}

impl ServiceControl {
    pub fn from_raw(raw_value: u32) -> Self {
        match raw_value {
            0x0000_0001 => ServiceControl::Stop,
            0x0000_0002 => ServiceControl::Pause,
            0x0000_0003 => ServiceControl::Continue,
            0x0000_0004 => ServiceControl::Interrogate,
            0x0000_0005 => ServiceControl::Shutdown,
            0x0000_000F => ServiceControl::Preshutdown,
            other => ServiceControl::Unknown(other),
        }
    }

    pub fn to_raw(&self) -> u32 {
        match *self {
            ServiceControl::Stop => 0x0000_0001,
            ServiceControl::Pause => 0x0000_0002,
            ServiceControl::Continue => 0x0000_0003,
            ServiceControl::Interrogate => 0x0000_0004,
            ServiceControl::Shutdown => 0x0000_0005,
            ServiceControl::Preshutdown => 0x0000_000F,
            ServiceControl::Unknown(raw) => raw,
        }
    }
}

/// Service state returned as a part of [`ServiceStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServiceState {
    Stopped = 0x0000_0001,
    StartPending = 0x0000_0002,
    StopPending = 0x0000_0003,
    Running = 0x0000_0004,
    ContinuePending = 0x0000_0005,
    PausePending = 0x0000_0006,
    Paused = 0x0000_0007,
}

impl ServiceState {
    pub fn from_raw(raw_state: u32) -> Result<Self, ParseRawError> {
        match raw_state {
            x if x == ServiceState::Stopped.to_raw() => Ok(ServiceState::Stopped),
            x if x == ServiceState::StartPending.to_raw() => Ok(ServiceState::StartPending),
            x if x == ServiceState::StopPending.to_raw() => Ok(ServiceState::StopPending),
            x if x == ServiceState::Running.to_raw() => Ok(ServiceState::Running),
            x if x == ServiceState::ContinuePending.to_raw() => Ok(ServiceState::ContinuePending),
            x if x == ServiceState::PausePending.to_raw() => Ok(ServiceState::PausePending),
            x if x == ServiceState::Paused.to_raw() => Ok(ServiceState::Paused),
            _ => Err(ParseRawError::InvalidInteger(raw_state)),
        }
    }

    pub fn to_raw(&self) -> u32 {
        *self as u32
    }

    /// Whether the host expects checkpoint and wait hint updates in this state.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ServiceState::StartPending
                | ServiceState::StopPending
                | ServiceState::ContinuePending
                | ServiceState::PausePending
        )
    }
}

/// Error returned when a raw value cannot be converted into one of the typed enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseRawError {
    InvalidInteger(u32),
}

impl fmt::Display for ParseRawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseRawError::InvalidInteger(raw) => write!(f, "invalid integer value: {}", raw),
        }
    }
}

impl std::error::Error for ParseRawError {}

/// Service exit code abstraction.
///
/// The service can either return a win32 error code or a custom error code. In case of custom
/// error, `dwWin32ExitCode` has to be set to `ERROR_SERVICE_SPECIFIC_ERROR` and the
/// `dwServiceSpecificExitCode` assigned with custom error code.
///
/// Refer to the corresponding MSDN article for more info:\
/// <https://msdn.microsoft.com/en-us/library/windows/desktop/ms685996(v=vs.85).aspx>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceExitCode {
    Win32(u32),
    ServiceSpecific(u32),
}

impl ServiceExitCode {
    /// A `ServiceExitCode` indicating success, no errors.
    pub const NO_ERROR: Self = ServiceExitCode::Win32(0);

    /// Returns the `(dwWin32ExitCode, dwServiceSpecificExitCode)` pair.
    pub fn to_raw(&self) -> (u32, u32) {
        match *self {
            ServiceExitCode::Win32(win32_error_code) => (win32_error_code, 0),
            ServiceExitCode::ServiceSpecific(service_error_code) => {
                (ERROR_SERVICE_SPECIFIC_ERROR, service_error_code)
            }
        }
    }

    pub fn from_raw(win32_exit_code: u32, service_specific_exit_code: u32) -> Self {
        if win32_exit_code == ERROR_SERVICE_SPECIFIC_ERROR {
            ServiceExitCode::ServiceSpecific(service_specific_exit_code)
        } else {
            ServiceExitCode::Win32(win32_exit_code)
        }
    }
}

impl Default for ServiceExitCode {
    fn default() -> Self {
        Self::NO_ERROR
    }
}

bitflags::bitflags! {
    /// Flags describing accepted types of service control events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceControlAccept: u32 {
        /// The service can be stopped.
        const STOP = 0x0000_0001;

        /// The service can be paused and continued.
        const PAUSE_CONTINUE = 0x0000_0002;

        /// The service is notified when system shutdown occurs.
        const SHUTDOWN = 0x0000_0004;

        /// The service can perform preshutdown tasks.
        const PRESHUTDOWN = 0x0000_0100;
    }
}

/// Service status.
///
/// Please refer to the corresponding MSDN article on how to fill in the `exit_code`,
/// `checkpoint` and `wait_hint` fields:\
/// <https://msdn.microsoft.com/en-us/library/windows/desktop/ms685996(v=vs.85).aspx>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceStatus {
    /// Current state of the service.
    pub current_state: ServiceState,

    /// Control commands that service accepts.
    pub controls_accepted: ServiceControlAccept,

    /// The error code the service uses to report an error that occurs when it is starting or
    /// stopping.
    pub exit_code: ServiceExitCode,

    /// Progress value that should be increased during lengthy start, stop, pause or continue
    /// operations. Must be zero outside of pending states.
    pub checkpoint: u32,

    /// Estimated time for pending operation.
    /// This works as a timeout until the system assumes that the service hung, unless the
    /// state changes or the checkpoint is incremented first.
    pub wait_hint: Duration,
}

impl ServiceStatus {
    /// A status in `state` that accepts the given controls and carries no progress info.
    pub fn new(current_state: ServiceState, controls_accepted: ServiceControlAccept) -> Self {
        ServiceStatus {
            current_state,
            controls_accepted,
            exit_code: ServiceExitCode::NO_ERROR,
            checkpoint: 0,
            wait_hint: Duration::default(),
        }
    }

    pub fn stop_pending(checkpoint: u32, wait_hint: Duration) -> Self {
        ServiceStatus {
            checkpoint,
            wait_hint,
            ..ServiceStatus::new(ServiceState::StopPending, ServiceControlAccept::empty())
        }
    }

    pub fn stopped(exit_code: ServiceExitCode) -> Self {
        ServiceStatus {
            exit_code,
            ..ServiceStatus::new(ServiceState::Stopped, ServiceControlAccept::empty())
        }
    }

    /// Wait hint in milliseconds, saturated to fit `dwWaitHint`.
    pub fn wait_hint_millis(&self) -> u32 {
        u32::try_from(self.wait_hint.as_millis()).unwrap_or(u32::MAX)
    }

    #[cfg(windows)]
    pub(crate) fn to_raw(&self) -> windows_sys::Win32::System::Services::SERVICE_STATUS {
        use windows_sys::Win32::System::Services;

        let (win32_exit_code, service_specific_exit_code) = self.exit_code.to_raw();
        Services::SERVICE_STATUS {
            dwServiceType: Services::SERVICE_WIN32_OWN_PROCESS,
            dwCurrentState: self.current_state.to_raw(),
            dwControlsAccepted: self.controls_accepted.bits(),
            dwWin32ExitCode: win32_exit_code,
            dwServiceSpecificExitCode: service_specific_exit_code,
            dwCheckPoint: self.checkpoint,
            dwWaitHint: self.wait_hint_millis(),
        }
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::new(ServiceState::StartPending, ServiceControlAccept::empty())
    }
}

/// A control command delivered by the host together with the last status it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub command: ServiceControl,
    pub current_status: ServiceStatus,
}

impl ControlRequest {
    pub fn new(command: ServiceControl, current_status: ServiceStatus) -> Self {
        ControlRequest {
            command,
            current_status,
        }
    }
}

/// The last status a host reported, shared between the host's threads.
#[derive(Debug, Clone, Default)]
pub struct SharedStatus(Arc<Mutex<ServiceStatus>>);

impl SharedStatus {
    pub fn get(&self) -> ServiceStatus {
        self.lock().clone()
    }

    pub fn set(&self, status: ServiceStatus) {
        *self.lock() = status;
    }

    fn lock(&self) -> MutexGuard<'_, ServiceStatus> {
        // A status is always written whole, so a poisoned lock still holds a valid one.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
