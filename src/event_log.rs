//! Logging capability injected into the service controller.

/// Event id used for every entry written by the controller.
pub const EVENT_ID: u32 = 1;

/// A sink for service diagnostics.
///
/// Both methods are fire-and-forget and may be called concurrently from the control loop and
/// the preshutdown drain thread.
pub trait EventLog: Send + Sync {
    fn info(&self, event_id: u32, message: &str);
    fn error(&self, event_id: u32, message: &str);
}

/// [`EventLog`] that forwards entries to the `log` facade.
#[derive(Debug, Clone)]
pub struct LogFacade {
    source: String,
}

impl LogFacade {
    /// `source` is prefixed to every entry, usually the service name.
    pub fn new(source: impl Into<String>) -> Self {
        LogFacade {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl EventLog for LogFacade {
    fn info(&self, event_id: u32, message: &str) {
        log::info!("{} [{}]: {}", self.source, event_id, message);
    }

    fn error(&self, event_id: u32, message: &str) {
        log::error!("{} [{}]: {}", self.source, event_id, message);
    }
}
