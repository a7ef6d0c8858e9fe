use std::time::Duration;

use serde::{Deserialize, Serialize};
use uavtalk::DecoderConfig;

/// Who runs the service cycles of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    /// Callers drive the session: iteration and blocking calls run cycles
    /// themselves.
    #[default]
    Inline,
    /// A thread spawned by `Session::start` runs cycles; callers only wait.
    Background,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: ServiceMode,
    /// Background iteration waits for more objects instead of stopping at
    /// the end of what has been received. Inline iteration always blocks.
    pub iter_blocks: bool,
    /// Speak the connection status protocol. Required to send or request.
    pub handshaking: bool,
    pub use_walltime: bool,
    /// The stream is a GCS log with timestamp/size prefixed records.
    pub gcs_timestamps: bool,
    /// Upper bound on one transport receive.
    pub receive_timeout: Duration,
    /// Retransmissions of an object request before it completes empty.
    pub request_retries: u32,
    pub request_retry_interval: Duration,
    pub ack_attempts: u32,
    pub ack_timeout: Duration,
    pub file_poll: Duration,
    /// Requests for one file chunk before the transfer fails.
    pub file_request_attempts: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mode: ServiceMode::Inline,
            iter_blocks: true,
            handshaking: false,
            use_walltime: true,
            gcs_timestamps: false,
            receive_timeout: Duration::from_millis(50),
            request_retries: 4,
            request_retry_interval: Duration::from_millis(400),
            ack_attempts: 8,
            ack_timeout: Duration::from_millis(260),
            file_poll: Duration::from_secs(1),
            file_request_attempts: 10,
        }
    }
}

impl SessionConfig {
    /// Live link to a flight controller.
    pub fn link() -> Self {
        SessionConfig {
            handshaking: true,
            ..Default::default()
        }
    }

    /// Receive-only playback of a recorded log.
    pub fn replay() -> Self {
        SessionConfig {
            handshaking: false,
            use_walltime: false,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: ServiceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_iter_blocks(mut self, iter_blocks: bool) -> Self {
        self.iter_blocks = iter_blocks;
        self
    }

    pub fn with_handshaking(mut self, handshaking: bool) -> Self {
        self.handshaking = handshaking;
        self
    }

    pub fn with_walltime(mut self, use_walltime: bool) -> Self {
        self.use_walltime = use_walltime;
        self
    }

    pub fn with_gcs_timestamps(mut self, gcs_timestamps: bool) -> Self {
        self.gcs_timestamps = gcs_timestamps;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_request_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.request_retries = retries;
        self.request_retry_interval = interval;
        self
    }

    pub fn with_ack(mut self, attempts: u32, timeout: Duration) -> Self {
        self.ack_attempts = attempts;
        self.ack_timeout = timeout;
        self
    }

    pub fn with_file_poll(mut self, poll: Duration, attempts: usize) -> Self {
        self.file_poll = poll;
        self.file_request_attempts = attempts;
        self
    }

    pub(crate) fn decoder(&self) -> DecoderConfig {
        DecoderConfig::default()
            .with_walltime(self.use_walltime)
            .with_gcs_timestamps(self.gcs_timestamps)
    }
}
