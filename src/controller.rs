//! The service control loop.
//!
//! [`ServiceController::execute`] is what a host runs on the service thread. It reports
//! `StartPending` followed by `Running`, then beeps on every tick while answering control
//! requests until it is told to stop or a preshutdown drain completes.

use std::ffi::OsString;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, Sender};

use crate::beep::Beeper;
use crate::event_log::{EventLog, EVENT_ID};
use crate::preshutdown::{DrainJob, DrainSettings};
use crate::service::{
    ControlRequest, ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState,
    ServiceStatus,
};

/// Controls accepted while the service is running or paused.
pub const ACCEPTED_CONTROLS: ServiceControlAccept = ServiceControlAccept::STOP
    .union(ServiceControlAccept::SHUTDOWN)
    .union(ServiceControlAccept::PAUSE_CONTINUE)
    .union(ServiceControlAccept::PRESHUTDOWN);

/// Timing of the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Tick period while running.
    pub fast_tick: Duration,
    /// Tick period while paused.
    pub slow_tick: Duration,
    /// Pause between the two replies to an interrogate request.
    pub interrogate_delay: Duration,
    /// Checkpoint the preshutdown drain starts counting from.
    pub initial_checkpoint: u32,
    pub drain: DrainSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            fast_tick: Duration::from_millis(500),
            slow_tick: Duration::from_secs(2),
            interrogate_delay: Duration::from_millis(100),
            initial_checkpoint: 1,
            drain: DrainSettings::default(),
        }
    }
}

/// The tick cadence that is currently driving the beeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Fast,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// The state machine behind the beep service.
///
/// Owns the tick cadence, the checkpoint reported with the final `StopPending` and the
/// preshutdown drain, if one is running. Messages go to the injected [`EventLog`], each tick
/// invokes the [`Beeper`].
pub struct ServiceController<L: ?Sized, B> {
    config: ControllerConfig,
    log: Arc<L>,
    beeper: B,
    tick_source: TickSource,
    checkpoint: u32,
    drain: Option<DrainJob>,
    status_closed: bool,
}

impl<L, B> ServiceController<L, B>
where
    L: EventLog + ?Sized + 'static,
    B: Beeper,
{
    /// Creates a controller that starts on the fast cadence with no drain running.
    pub fn new(config: ControllerConfig, log: Arc<L>, beeper: B) -> Self {
        let checkpoint = config.initial_checkpoint;
        ServiceController {
            config,
            log,
            beeper,
            tick_source: TickSource::Fast,
            checkpoint,
            drain: None,
            status_closed: false,
        }
    }

    /// The cadence currently driving the beeper. `Slow` while paused.
    pub fn tick_source(&self) -> TickSource {
        self.tick_source
    }

    /// Whether a preshutdown drain has been started.
    pub fn is_draining(&self) -> bool {
        self.drain.is_some()
    }

    /// Runs the control loop until a stop, shutdown or completed preshutdown drain, blocking
    /// the calling thread.
    ///
    /// Status updates are sent on `status`. The last update sent is always `StopPending`; the
    /// host is expected to report `Stopped` with the returned exit code afterwards.
    ///
    /// When the host drops its end of `requests` the loop exits, unless a preshutdown drain is
    /// running, in which case the drain is allowed to finish. When the host drops its end of
    /// `status` the failure is logged once and the loop exits without reporting anything else.
    pub fn execute(
        mut self,
        _arguments: &[OsString],
        requests: Receiver<ControlRequest>,
        status: Sender<ServiceStatus>,
    ) -> ServiceExitCode {
        let mut flow = self.report(
            &status,
            ServiceStatus::new(ServiceState::StartPending, ServiceControlAccept::empty()),
        );
        if flow == Flow::Exit {
            return ServiceExitCode::NO_ERROR;
        }

        let fast_tick = channel::tick(self.config.fast_tick);
        let slow_tick = channel::tick(self.config.slow_tick);
        let no_requests = channel::never();
        let mut requests_open = true;

        flow = self.report(
            &status,
            ServiceStatus::new(ServiceState::Running, ACCEPTED_CONTROLS),
        );
        while flow == Flow::Continue {
            let tick = match self.tick_source {
                TickSource::Fast => &fast_tick,
                TickSource::Slow => &slow_tick,
            };
            let drain_done = match &self.drain {
                Some(job) => job.done().clone(),
                None => channel::never(),
            };
            let incoming = if requests_open {
                &requests
            } else {
                &no_requests
            };

            flow = channel::select! {
                recv(drain_done) -> _ => Flow::Exit,
                recv(tick) -> _ => {
                    self.beeper.beep();
                    Flow::Continue
                }
                recv(incoming) -> request => match request {
                    Ok(request) => self.handle_request(request, &status),
                    Err(_) if self.drain.is_some() => {
                        self.log.info(
                            EVENT_ID,
                            "Control request channel closed, waiting for preshutdown to finish",
                        );
                        requests_open = false;
                        Flow::Continue
                    }
                    Err(_) => {
                        self.log.info(EVENT_ID, "Control request channel closed");
                        Flow::Exit
                    }
                },
            };
        }

        // A drain still in flight is cancelled so nothing is reported after the final status.
        if let Some(job) = self.drain.take() {
            self.checkpoint = job.stop();
        }
        if !self.status_closed {
            self.report(
                &status,
                ServiceStatus::stop_pending(self.checkpoint, Duration::ZERO),
            );
        }

        ServiceExitCode::NO_ERROR
    }

    fn handle_request(&mut self, request: ControlRequest, status: &Sender<ServiceStatus>) -> Flow {
        match request.command {
            ServiceControl::Interrogate => {
                // Answered twice with a delay in between, some hosts used to deadlock on this.
                if self.report(status, request.current_status.clone()) == Flow::Exit {
                    return Flow::Exit;
                }
                thread::sleep(self.config.interrogate_delay);
                self.report(status, request.current_status)
            }
            ServiceControl::Stop | ServiceControl::Shutdown => Flow::Exit,
            ServiceControl::Preshutdown => self.begin_preshutdown(status),
            ServiceControl::Pause => {
                self.tick_source = TickSource::Slow;
                self.report(
                    status,
                    ServiceStatus::new(ServiceState::Paused, ACCEPTED_CONTROLS),
                )
            }
            ServiceControl::Continue => {
                self.tick_source = TickSource::Fast;
                self.report(
                    status,
                    ServiceStatus::new(ServiceState::Running, ACCEPTED_CONTROLS),
                )
            }
            ServiceControl::Unknown(code) => {
                self.log
                    .error(EVENT_ID, &format!("unexpected control request #{}", code));
                Flow::Continue
            }
        }
    }

    fn begin_preshutdown(&mut self, status: &Sender<ServiceStatus>) -> Flow {
        if self.drain.is_some() {
            self.log.info(EVENT_ID, "Preshutdown already in progress");
            return Flow::Continue;
        }

        match DrainJob::start(
            self.config.drain.clone(),
            self.checkpoint,
            status.clone(),
            self.log.clone(),
        ) {
            Ok(job) => {
                self.drain = Some(job);
                Flow::Continue
            }
            Err(e) => {
                self.log.error(
                    EVENT_ID,
                    &format!("Unable to start preshutdown drain: {}", e),
                );
                Flow::Exit
            }
        }
    }

    fn report(&mut self, status: &Sender<ServiceStatus>, update: ServiceStatus) -> Flow {
        if self.status_closed {
            return Flow::Exit;
        }
        match status.send(update) {
            Ok(()) => Flow::Continue,
            Err(_) => {
                self.log.error(EVENT_ID, "Status channel closed");
                self.status_closed = true;
                Flow::Exit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::tests::RecordingLog;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::JoinHandle;

    type TestController = ServiceController<RecordingLog, Box<dyn FnMut() + Send>>;

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            fast_tick: Duration::from_millis(1),
            slow_tick: Duration::from_millis(20),
            interrogate_delay: Duration::from_millis(5),
            initial_checkpoint: 1,
            drain: DrainSettings {
                interval: Duration::from_millis(2),
                iterations: 30,
                wait_hint: Duration::from_millis(3000),
            },
        }
    }

    fn controller(config: ControllerConfig) -> (TestController, Arc<RecordingLog>) {
        let log = Arc::new(RecordingLog::default());
        let beeper: Box<dyn FnMut() + Send> = Box::new(|| {});
        (ServiceController::new(config, log.clone(), beeper), log)
    }

    fn request(command: ServiceControl) -> ControlRequest {
        ControlRequest::new(
            command,
            ServiceStatus::new(ServiceState::Running, ACCEPTED_CONTROLS),
        )
    }

    struct Running {
        requests: Sender<ControlRequest>,
        status: Receiver<ServiceStatus>,
        thread: JoinHandle<ServiceExitCode>,
    }

    fn spawn(controller: TestController) -> Running {
        let (request_tx, request_rx) = channel::unbounded();
        let (status_tx, status_rx) = channel::unbounded();
        let thread = thread::spawn(move || controller.execute(&[], request_rx, status_tx));
        Running {
            requests: request_tx,
            status: status_rx,
            thread,
        }
    }

    impl Running {
        fn send(&self, command: ServiceControl) {
            self.requests.send(request(command)).unwrap();
        }

        fn join(self) -> (ServiceExitCode, Vec<ServiceStatus>) {
            let exit_code = self.thread.join().unwrap();
            (exit_code, self.status.try_iter().collect())
        }
    }

    #[test]
    fn test_startup_then_stop() {
        let (controller, _log) = controller(test_config());
        let running = spawn(controller);
        running.send(ServiceControl::Stop);
        let (exit_code, statuses) = running.join();

        assert_eq!(exit_code, ServiceExitCode::NO_ERROR);
        assert_eq!(
            statuses,
            vec![
                ServiceStatus::new(ServiceState::StartPending, ServiceControlAccept::empty()),
                ServiceStatus::new(ServiceState::Running, ACCEPTED_CONTROLS),
                ServiceStatus::stop_pending(1, Duration::ZERO),
            ]
        );
    }

    #[test]
    fn test_shutdown_exits() {
        let (mut controller, _log) = controller(test_config());
        let (status_tx, status_rx) = channel::unbounded();
        assert_eq!(
            controller.handle_request(request(ServiceControl::Shutdown), &status_tx),
            Flow::Exit
        );
        assert_eq!(
            controller.handle_request(request(ServiceControl::Stop), &status_tx),
            Flow::Exit
        );
        assert!(status_rx.try_recv().is_err());
    }

    /// Every sequence over `alphabet` of length `0..=max_len`.
    fn sequences(alphabet: &[ServiceControl], max_len: usize) -> Vec<Vec<ServiceControl>> {
        let mut all = vec![Vec::new()];
        let mut previous = vec![Vec::new()];
        for _ in 0..max_len {
            let mut next = Vec::new();
            for prefix in &previous {
                for command in alphabet {
                    let mut sequence: Vec<ServiceControl> = prefix.clone();
                    sequence.push(*command);
                    next.push(sequence);
                }
            }
            all.extend(next.iter().cloned());
            previous = next;
        }
        all
    }

    #[test]
    fn test_pause_and_continue_switch_tick_source() {
        let alphabet = [
            ServiceControl::Pause,
            ServiceControl::Continue,
            ServiceControl::Interrogate,
            ServiceControl::Unknown(9),
        ];
        let all = sequences(&alphabet, 5);
        assert_eq!(all.len(), 1 + 4 + 16 + 64 + 256 + 1024);

        for sequence in all {
            let mut config = test_config();
            config.interrogate_delay = Duration::ZERO;
            let (mut controller, log) = controller(config);
            let (status_tx, status_rx) = channel::unbounded();

            let mut expected = TickSource::Fast;
            for command in &sequence {
                assert_eq!(
                    controller.handle_request(request(*command), &status_tx),
                    Flow::Continue,
                    "{:?}",
                    sequence
                );
                let replies: Vec<ServiceStatus> = status_rx.try_iter().collect();
                match command {
                    ServiceControl::Pause => {
                        expected = TickSource::Slow;
                        assert_eq!(
                            replies,
                            vec![ServiceStatus::new(ServiceState::Paused, ACCEPTED_CONTROLS)]
                        );
                    }
                    ServiceControl::Continue => {
                        expected = TickSource::Fast;
                        assert_eq!(
                            replies,
                            vec![ServiceStatus::new(ServiceState::Running, ACCEPTED_CONTROLS)]
                        );
                    }
                    ServiceControl::Interrogate => assert_eq!(replies.len(), 2),
                    _ => assert!(replies.is_empty()),
                }
                assert_eq!(controller.tick_source(), expected, "{:?}", sequence);
            }

            let unknown = sequence
                .iter()
                .filter(|c| matches!(c, ServiceControl::Unknown(_)))
                .count();
            assert_eq!(log.errors().len(), unknown);
            assert!(!controller.is_draining());
        }
    }

    #[test]
    fn test_interrogate_replies_twice_with_snapshot() {
        let (mut controller, log) = controller(test_config());
        let (status_tx, status_rx) = channel::unbounded();
        let snapshot = ServiceStatus {
            checkpoint: 4,
            ..ServiceStatus::new(ServiceState::Paused, ACCEPTED_CONTROLS)
        };

        let flow = controller.handle_request(
            ControlRequest::new(ServiceControl::Interrogate, snapshot.clone()),
            &status_tx,
        );

        assert_eq!(flow, Flow::Continue);
        assert_eq!(status_rx.try_iter().collect::<Vec<_>>(), vec![snapshot.clone(), snapshot]);
        assert_eq!(controller.tick_source(), TickSource::Fast);
        assert!(!controller.is_draining());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_unknown_control_is_logged_once() {
        let (mut controller, log) = controller(test_config());
        let (status_tx, status_rx) = channel::unbounded();

        let flow = controller.handle_request(request(ServiceControl::Unknown(0x40)), &status_tx);

        assert_eq!(flow, Flow::Continue);
        assert!(status_rx.try_recv().is_err());
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.errors(), vec!["unexpected control request #64".to_owned()]);
    }

    #[test]
    fn test_non_terminal_requests_keep_running() {
        let table: &[&[ServiceControl]] = &[
            &[],
            &[ServiceControl::Pause, ServiceControl::Pause, ServiceControl::Pause],
            &[ServiceControl::Continue, ServiceControl::Unknown(200)],
            &[
                ServiceControl::Interrogate,
                ServiceControl::Pause,
                ServiceControl::Unknown(200),
                ServiceControl::Continue,
                ServiceControl::Unknown(201),
                ServiceControl::Pause,
            ],
            &[
                ServiceControl::Unknown(0),
                ServiceControl::Unknown(u32::MAX),
                ServiceControl::Interrogate,
                ServiceControl::Interrogate,
            ],
            &[
                ServiceControl::Pause,
                ServiceControl::Interrogate,
                ServiceControl::Continue,
                ServiceControl::Interrogate,
                ServiceControl::Pause,
                ServiceControl::Continue,
            ],
        ];

        for sequence in table {
            let (controller, log) = controller(test_config());
            let running = spawn(controller);
            for (i, command) in sequence.iter().enumerate() {
                running.send(*command);
                // Let some ticks land between requests.
                if i % 2 == 1 {
                    thread::sleep(Duration::from_millis(3));
                }
            }
            thread::sleep(Duration::from_millis(60));
            assert!(!running.thread.is_finished(), "{:?}", sequence);

            running.send(ServiceControl::Stop);
            let (_, statuses) = running.join();
            assert_eq!(
                statuses.last(),
                Some(&ServiceStatus::stop_pending(1, Duration::ZERO))
            );
            let unknown = sequence
                .iter()
                .filter(|c| matches!(c, ServiceControl::Unknown(_)))
                .count();
            assert_eq!(log.errors().len(), unknown, "{:?}", sequence);
        }
    }

    #[test]
    fn test_ticks_beep() {
        let beeps = Arc::new(AtomicUsize::new(0));
        let counter = beeps.clone();
        let beeper: Box<dyn FnMut() + Send> = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let controller: TestController =
            ServiceController::new(test_config(), Arc::new(RecordingLog::default()), beeper);

        let running = spawn(controller);
        thread::sleep(Duration::from_millis(50));
        running.send(ServiceControl::Stop);
        running.join();

        assert!(beeps.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_preshutdown_drains_then_exits() {
        let (controller, log) = controller(test_config());
        let running = spawn(controller);
        running.send(ServiceControl::Preshutdown);
        let (exit_code, statuses) = running.join();

        assert_eq!(exit_code, ServiceExitCode::NO_ERROR);
        let drain_updates: Vec<&ServiceStatus> = statuses
            .iter()
            .filter(|s| s.wait_hint == Duration::from_millis(3000))
            .collect();
        assert_eq!(drain_updates.len(), 30);
        for pair in drain_updates.windows(2) {
            assert!(pair[1].checkpoint > pair[0].checkpoint);
        }
        assert_eq!(drain_updates[0].checkpoint, 1);
        assert_eq!(
            statuses.last(),
            Some(&ServiceStatus::stop_pending(31, Duration::ZERO))
        );
        assert!(log
            .infos()
            .contains(&"Preshutdown keep alive end".to_owned()));
    }

    #[test]
    fn test_stop_during_drain_reports_final_checkpoint() {
        let mut config = test_config();
        config.drain.interval = Duration::from_secs(60);
        let (controller, _log) = controller(config);
        let running = spawn(controller);
        running.send(ServiceControl::Preshutdown);

        let first_drain_update = running
            .status
            .iter()
            .find(|s| s.wait_hint == Duration::from_millis(3000))
            .unwrap();
        running.send(ServiceControl::Stop);
        let (_, statuses) = running.join();

        let last = statuses.last().unwrap();
        assert_eq!(last.current_state, ServiceState::StopPending);
        assert_eq!(last.wait_hint, Duration::ZERO);
        assert!(last.checkpoint >= first_drain_update.checkpoint);
        assert!(statuses[..statuses.len() - 1]
            .iter()
            .all(|s| s.checkpoint < last.checkpoint));
    }

    #[test]
    fn test_second_preshutdown_is_ignored() {
        let (controller, log) = controller(test_config());
        let running = spawn(controller);
        running.send(ServiceControl::Preshutdown);
        running.send(ServiceControl::Preshutdown);
        let (_, statuses) = running.join();

        let checkpoints: Vec<u32> = statuses
            .iter()
            .filter(|s| s.wait_hint == Duration::from_millis(3000))
            .map(|s| s.checkpoint)
            .collect();
        assert_eq!(checkpoints, (1..=30).collect::<Vec<u32>>());
        assert_eq!(
            log.infos()
                .iter()
                .filter(|m| *m == "Preshutdown already in progress")
                .count(),
            1
        );
        assert_eq!(
            log.infos().iter().filter(|m| *m == "Preshutdown").count(),
            1
        );
    }

    #[test]
    fn test_closed_request_channel_exits() {
        let (controller, log) = controller(test_config());
        let running = spawn(controller);
        let Running {
            requests,
            status,
            thread,
        } = running;
        drop(requests);

        assert_eq!(thread.join().unwrap(), ServiceExitCode::NO_ERROR);
        let statuses: Vec<ServiceStatus> = status.try_iter().collect();
        assert_eq!(
            statuses.last(),
            Some(&ServiceStatus::stop_pending(1, Duration::ZERO))
        );
        assert!(log
            .infos()
            .contains(&"Control request channel closed".to_owned()));
    }

    #[test]
    fn test_closed_request_channel_lets_drain_finish() {
        let (controller, log) = controller(test_config());
        let Running {
            requests,
            status,
            thread,
        } = spawn(controller);
        requests.send(request(ServiceControl::Preshutdown)).unwrap();
        drop(requests);

        assert_eq!(thread.join().unwrap(), ServiceExitCode::NO_ERROR);
        let statuses: Vec<ServiceStatus> = status.try_iter().collect();
        let checkpoints: Vec<u32> = statuses
            .iter()
            .filter(|s| s.wait_hint == Duration::from_millis(3000))
            .map(|s| s.checkpoint)
            .collect();
        assert_eq!(checkpoints, (1..=30).collect::<Vec<u32>>());
        assert_eq!(
            statuses.last(),
            Some(&ServiceStatus::stop_pending(31, Duration::ZERO))
        );
        assert!(log
            .infos()
            .contains(&"Preshutdown keep alive end".to_owned()));
        assert!(!log.infos().contains(&"Preshutdown cancelled".to_owned()));
    }

    #[test]
    fn test_closed_status_channel_is_logged_once() {
        let (controller, log) = controller(test_config());
        let (request_tx, request_rx) = channel::unbounded();
        let (status_tx, status_rx) = channel::unbounded();
        drop(status_rx);
        request_tx.send(request(ServiceControl::Stop)).unwrap();

        let exit_code = controller.execute(&[], request_rx, status_tx);

        assert_eq!(exit_code, ServiceExitCode::NO_ERROR);
        assert_eq!(log.errors(), vec!["Status channel closed".to_owned()]);
    }

    #[test]
    fn test_status_channel_closed_while_running_is_logged_once() {
        let (controller, log) = controller(test_config());
        let Running {
            requests,
            status,
            thread,
        } = spawn(controller);
        assert_eq!(status.recv().unwrap().current_state, ServiceState::StartPending);
        assert_eq!(status.recv().unwrap().current_state, ServiceState::Running);
        drop(status);

        requests.send(request(ServiceControl::Pause)).unwrap();
        assert_eq!(thread.join().unwrap(), ServiceExitCode::NO_ERROR);
        assert_eq!(log.errors(), vec!["Status channel closed".to_owned()]);
    }
}
