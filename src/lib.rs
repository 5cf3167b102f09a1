// Copyright 2017 Amagicom AB.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A demonstration Windows service that beeps on a timer and reacts to the control requests
//! sent by the Service Control Manager (SCM).
//!
//! # Overview
//!
//! The interesting part lives in [`controller::ServiceController`]. Its
//! [`execute`](controller::ServiceController::execute) method is a plain blocking function
//! over two channels: control requests come in, status updates go out. It knows nothing
//! about how the process was registered with the system, which makes it easy to drive from
//! tests or from a console.
//!
//! Two hosts run the controller:
//!
//! - `host::serve` (Windows only) registers a control handler with the SCM, forwards
//!   every control as a [`ControlRequest`](service::ControlRequest) and pushes status updates
//!   into `SetServiceStatus`.
//! - [`debug::DebugHost`] runs the controller on a thread inside the current process.
//!
//! ## Running as a service
//!
//! ```rust,ignore
//! #[macro_use]
//! extern crate beep_service;
//!
//! use std::ffi::OsString;
//! use std::sync::Arc;
//! use beep_service::beep::SystemBeep;
//! use beep_service::controller::{ControllerConfig, ServiceController};
//! use beep_service::event_log::LogFacade;
//! use beep_service::{host, service_dispatcher, Result};
//!
//! define_windows_service!(ffi_service_main, my_service_main);
//!
//! fn my_service_main(arguments: Vec<OsString>) {
//!     let log = Arc::new(LogFacade::new("beep_service"));
//!     let controller = ServiceController::new(ControllerConfig::default(), log, SystemBeep);
//!     if let Err(_e) = host::serve("beep_service", arguments, controller) {
//!         // Handle errors in some way.
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     // Register generated `ffi_service_main` with the system and start the service, blocking
//!     // this thread until the service is stopped.
//!     service_dispatcher::start("beep_service", ffi_service_main)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Status updates
//!
//! The controller reports `StartPending` and then `Running` right away. Pausing switches the
//! beeper to a slower tick and continuing switches it back.
//!
//! A preshutdown notification starts a [`DrainJob`](preshutdown::DrainJob) which, once a
//! second for thirty seconds, reports `StopPending` with an incremented
//! [`ServiceStatus::checkpoint`] and a [`ServiceStatus::wait_hint`] larger than the time
//! until the next update, so the SCM does not consider the service hung.
//!
//! Please refer to the "Service State Transitions" article on MSDN for more info:\
//! <https://msdn.microsoft.com/en-us/library/windows/desktop/ee126211(v=vs.85).aspx>
//!
//! [`ServiceStatus::wait_hint`]: service::ServiceStatus::wait_hint
//! [`ServiceStatus::checkpoint`]: service::ServiceStatus::checkpoint

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Invalid service name.
    #[cfg(windows)]
    InvalidServiceName(widestring::error::ContainsNul<u16>),

    /// Failed to spawn a worker thread.
    ThreadSpawn(std::io::Error),

    /// A worker thread panicked.
    ThreadPanicked,

    /// IO error when calling winapi
    Winapi(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            #[cfg(windows)]
            InvalidServiceName(_) => write!(f, "Invalid service name"),
            ThreadSpawn(_) => write!(f, "Unable to spawn thread"),
            ThreadPanicked => write!(f, "Worker thread panicked"),
            Winapi(_) => write!(f, "IO error in winapi call"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;
        match self {
            #[cfg(windows)]
            InvalidServiceName(err) => Some(err),
            ThreadSpawn(err) => Some(err),
            ThreadPanicked => None,
            Winapi(err) => Some(err),
        }
    }
}

pub mod beep;
pub mod controller;
pub mod debug;
pub mod event_log;
pub mod preshutdown;
pub mod service;

#[cfg(windows)]
pub mod host;
#[cfg(windows)]
pub mod service_control_handler;
#[cfg(windows)]
#[macro_use]
pub mod service_dispatcher;
