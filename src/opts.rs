use std::time::Duration;

/// Options that control how a decode pump runs.
///
/// This struct represents *library-level configuration*. Callers construct it
/// programmatically and hand it to `DecodePumpBuilder::opts`.
#[derive(Debug, Clone)]
pub struct PumpOpts {
    /// How many stop/configure/start cycles a session may go through in a row after
    /// recoverable codec errors before the failure is escalated.
    ///
    /// The counter resets whenever a buffer with payload is rendered.
    pub max_recovery_attempts: u32,

    /// Upper bound on how long `DecodePump::create` blocks waiting for setup.
    ///
    /// `None` waits for as long as codec enumeration takes. Timing out does not cancel
    /// setup; it only returns control to the caller.
    pub setup_timeout: Option<Duration>,

    /// Name given to the pump's worker thread.
    pub thread_name: String,
}

impl Default for PumpOpts {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            setup_timeout: None,
            thread_name: "decode-pump".to_string(),
        }
    }
}
