use std::fmt;

use crate::format::FormatDescriptor;

/// Lifecycle of the pump's codec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Configuring,
    Running,
    /// End-of-stream came out of the decoder; teardown is in progress.
    Draining,
    /// Decoding finished and the session was released.
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Configuring => "configuring",
            SessionState::Running => "running",
            SessionState::Draining => "draining",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Counters kept by the pump across its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub samples_submitted: u64,
    pub buffers_rendered: u64,
    /// Output buffers released without rendering (config-only or empty).
    pub buffers_dropped: u64,
    pub recoveries: u64,
}

/// Point-in-time view of a pump, taken on its worker thread.
#[derive(Debug, Clone)]
pub struct PumpSnapshot {
    pub state: SessionState,
    pub codec_name: Option<String>,
    pub reader_exhausted: bool,
    pub end_of_stream_submitted: bool,
    pub decoder_finished: bool,
    pub output_format: Option<FormatDescriptor>,
    pub stats: PumpStats,
}

/// A boolean that can only go from `false` to `true`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Latch(bool);

impl Latch {
    pub(crate) fn get(self) -> bool {
        self.0
    }

    /// Set the latch; returns `true` only for the call that flipped it.
    pub(crate) fn set(&mut self) -> bool {
        !std::mem::replace(&mut self.0, true)
    }
}
