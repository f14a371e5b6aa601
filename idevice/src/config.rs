//! Connection tunables

use std::sync::Arc;
use std::time::Duration;

use crate::diagnostics::{DiagnosticSink, NoopSink};

/// Port lockdownd listens on
pub const LOCKDOWN_PORT: u16 = 62078;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    /// Sent as `Label` with every lockdown request
    pub label: String,
    /// Added to twice the device's heartbeat interval before a missed ping
    /// ends the session
    pub heartbeat_grace: Duration,
    /// Bound on the StopSession exchange so teardown cannot hang
    pub stop_session_timeout: Duration,
    pub sink: Arc<dyn DiagnosticSink>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: LOCKDOWN_PORT,
            label: "idevice-link".to_string(),
            heartbeat_grace: Duration::from_secs(5),
            stop_session_timeout: Duration::from_secs(2),
            sink: Arc::new(NoopSink),
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn with_heartbeat_grace(mut self, grace: Duration) -> Self {
        self.heartbeat_grace = grace;
        self
    }

    #[must_use]
    pub fn with_stop_session_timeout(mut self, timeout: Duration) -> Self {
        self.stop_session_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[cfg(feature = "retry")]
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// How long `give` waits for a blocked caller before discarding its pair
    pub give_timeout: Duration,
    /// Used by `give` to build replacement sessions
    pub connect: ConnectOptions,
}

#[cfg(feature = "retry")]
impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            give_timeout: Duration::from_secs(5),
            connect: ConnectOptions::default(),
        }
    }
}

#[cfg(feature = "retry")]
impl RetryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_give_timeout(mut self, timeout: Duration) -> Self {
        self.give_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_options(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }
}
