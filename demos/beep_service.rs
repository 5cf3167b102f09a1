// Beep service example.
//
// When started by the Service Control Manager the service beeps twice a second, slows down to
// once every two seconds while paused and keeps the SCM informed for thirty seconds after a
// preshutdown notification. Logs are written to `beep_service.log` in the temp directory.
//
// Installing the service is out of scope for this example, use `sc.exe create` or the
// `windows-service` crate's install example.
//
// Start the service: `net start beep_service`
// Pause the service: `net pause beep_service`
// Stop the service: `net stop beep_service`
//
// Started from a console the controller runs in-process instead and reads controls from
// stdin, one per line: `stop`, `shutdown`, `pause`, `continue`, `interrogate`, `preshutdown`
// or a raw control code.

const SERVICE_NAME: &str = "beep_service";

#[cfg(windows)]
fn main() -> beep_service::Result<()> {
    beep_service_main::run()
}

#[cfg(not(windows))]
fn main() -> beep_service::Result<()> {
    console::run()
}

#[cfg(windows)]
mod beep_service_main {
    use std::ffi::OsString;
    use std::fs::File;
    use std::sync::Arc;

    use beep_service::beep::SystemBeep;
    use beep_service::controller::{ControllerConfig, ServiceController};
    use beep_service::event_log::{EventLog, LogFacade, EVENT_ID};
    use beep_service::{define_windows_service, host, service_dispatcher, Result};
    use simplelog::{Config, LevelFilter, WriteLogger};

    use super::SERVICE_NAME;

    pub fn run() -> Result<()> {
        // There is no stdout or stderr when running as a service.
        let log_path = std::env::temp_dir().join("beep_service.log");
        match File::create(&log_path) {
            Ok(file) => {
                let _ = WriteLogger::init(LevelFilter::Debug, Config::default(), file);
            }
            Err(e) => eprintln!("Unable to create {}: {}", log_path.display(), e),
        }

        // Register generated `ffi_service_main` with the system and start the service, blocking
        // this thread until the service is stopped.
        service_dispatcher::start(SERVICE_NAME, ffi_service_main)
    }

    define_windows_service!(ffi_service_main, my_service_main);

    fn my_service_main(arguments: Vec<OsString>) {
        let log = Arc::new(LogFacade::new(SERVICE_NAME));
        log.info(EVENT_ID, &format!("starting {} service", SERVICE_NAME));

        let controller = ServiceController::new(ControllerConfig::default(), log.clone(), SystemBeep);
        match host::serve(SERVICE_NAME, arguments, controller) {
            Ok(_) => log.info(EVENT_ID, &format!("{} service stopped", SERVICE_NAME)),
            Err(e) => log.error(EVENT_ID, &format!("{} service failed: {}", SERVICE_NAME, e)),
        }
    }
}

#[cfg(not(windows))]
mod console {
    use std::io::{self, BufRead};
    use std::sync::Arc;

    use beep_service::beep::SystemBeep;
    use beep_service::controller::{ControllerConfig, ServiceController};
    use beep_service::debug::DebugHost;
    use beep_service::event_log::LogFacade;
    use beep_service::service::ServiceControl;
    use beep_service::Result;
    use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

    use super::SERVICE_NAME;

    pub fn run() -> Result<()> {
        let _ = TermLogger::init(
            LevelFilter::Debug,
            Config::default(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        );

        let log = Arc::new(LogFacade::new(SERVICE_NAME));
        let controller = ServiceController::new(ControllerConfig::default(), log, SystemBeep);
        let host = DebugHost::start(std::env::args_os().skip(1).collect(), controller)?;

        for line in io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let command = match line.trim() {
                "" => continue,
                "stop" => ServiceControl::Stop,
                "shutdown" => ServiceControl::Shutdown,
                "pause" => ServiceControl::Pause,
                "continue" => ServiceControl::Continue,
                "interrogate" => ServiceControl::Interrogate,
                "preshutdown" => ServiceControl::Preshutdown,
                other => match other.parse::<u32>() {
                    Ok(raw) => ServiceControl::from_raw(raw),
                    Err(_) => {
                        log::warn!("Unknown control {:?}", other);
                        continue;
                    }
                },
            };
            if !host.control(command) {
                break;
            }
            if matches!(command, ServiceControl::Stop | ServiceControl::Shutdown) {
                break;
            }
        }

        // Treat end of input like a console Ctrl-C.
        host.control(ServiceControl::Stop);
        let exit_code = host.wait()?;
        log::info!("{} service stopped: {:?}", SERVICE_NAME, exit_code);
        Ok(())
    }
}
