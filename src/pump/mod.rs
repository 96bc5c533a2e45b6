// src/pump/mod.rs

//! The decode pump: a codec session driven from a dedicated worker thread.
//!
//! The worker is the pump's serial execution context. It owns the state machine
//! (`session::PumpCore`) and drains a single queue that carries both caller requests and codec
//! events, so callbacks are never handled concurrently.
//!
//! Blocking calls (`create`, `snapshot`, `wait_until_done`) send a request with a single-shot
//! reply channel and wait on it. Every caller waits on its own channel, so concurrent callers
//! cannot miss each other's wakeups.

mod session;
mod state;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{Span, info, info_span, warn};
use uuid::Uuid;

pub use session::ErrorHandler;
pub use state::{PumpSnapshot, PumpStats, SessionState};

use crate::codec::{CodecEvent, CodecRegistry, DownstreamEncoder, SharedFrameSink};
use crate::demux::SampleSource;
use crate::format::FormatDescriptor;
use crate::opts::PumpOpts;
use crate::{Error, Result};
use session::{EventPoster, PumpCore};

enum Message {
    Create {
        format: FormatDescriptor,
        reply: SyncSender<Result<()>>,
    },
    Codec {
        generation: u64,
        event: CodecEvent,
    },
    Snapshot(SyncSender<PumpSnapshot>),
    AwaitDone(SyncSender<Result<PumpStats>>),
    Shutdown,
}

/// Handle to a running decode pump.
///
/// Dropping the handle stops the worker and releases the codec session and the sample source.
pub struct DecodePump {
    id: Uuid,
    tx: Sender<Message>,
    setup_timeout: Option<Duration>,
    worker: Option<JoinHandle<()>>,
}

impl DecodePump {
    /// Start building a pump that feeds `source` into codecs from `registry`.
    pub fn builder(
        source: impl SampleSource + 'static,
        registry: Arc<dyn CodecRegistry>,
    ) -> DecodePumpBuilder {
        DecodePumpBuilder {
            source: Box::new(source),
            registry,
            surface: None,
            encoder: None,
            on_error: None,
            opts: PumpOpts::default(),
        }
    }

    /// Identifier attached to this pump's log span.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Set up a codec session for `format` and block until setup has finished.
    ///
    /// Uses `PumpOpts::setup_timeout` when one is configured. A live session is torn down
    /// before the new one is created. When no implementation accepts the format this returns
    /// `Error::NotSupported`; the error handler hears about it too.
    pub fn create(&self, format: FormatDescriptor) -> Result<()> {
        if let Some(timeout) = self.setup_timeout {
            return self.create_timeout(format, timeout);
        }

        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Message::Create { format, reply })?;
        rx.recv().map_err(|_| Error::PumpClosed)?
    }

    /// Like `create`, but stop waiting after `timeout`.
    ///
    /// Setup cannot be cancelled: on `Error::SetupTimedOut` it keeps running on the worker and
    /// its outcome shows up in later snapshots.
    pub fn create_timeout(&self, format: FormatDescriptor, timeout: Duration) -> Result<()> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Message::Create { format, reply })?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::SetupTimedOut(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::PumpClosed),
        }
    }

    /// Current state, flags, and counters.
    pub fn snapshot(&self) -> Result<PumpSnapshot> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Message::Snapshot(reply))?;
        rx.recv().map_err(|_| Error::PumpClosed)
    }

    /// Block until the decoder reports end-of-stream (returning the final counters) or the
    /// pump fails.
    pub fn wait_until_done(&self) -> Result<PumpStats> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Message::AwaitDone(reply))?;
        rx.recv().map_err(|_| Error::PumpClosed)?
    }

    fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::PumpClosed)
    }
}

impl Drop for DecodePump {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(pump = %self.id, "decode pump worker panicked");
            }
        }
    }
}

/// Collects a pump's collaborators before its worker is spawned.
pub struct DecodePumpBuilder {
    source: Box<dyn SampleSource>,
    registry: Arc<dyn CodecRegistry>,
    surface: Option<SharedFrameSink>,
    encoder: Option<Arc<dyn DownstreamEncoder>>,
    on_error: Option<ErrorHandler>,
    opts: PumpOpts,
}

impl DecodePumpBuilder {
    /// Output target handed to the codec at configuration time.
    pub fn surface(mut self, surface: SharedFrameSink) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Encoder to notify once decoding has finished.
    pub fn encoder(mut self, encoder: Arc<dyn DownstreamEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Callback for failures the pump does not handle itself. Runs on the worker thread.
    pub fn on_error(mut self, handler: impl FnMut(Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    pub fn opts(mut self, opts: PumpOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Spawn the worker thread. No codec is created until `DecodePump::create`.
    pub fn spawn(self) -> Result<DecodePump> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel();

        let events = tx.clone();
        let poster: EventPoster = Arc::new(move |generation, event| {
            // The worker may already be gone during shutdown; late events are irrelevant then.
            let _ = events.send(Message::Codec { generation, event });
        });

        let setup_timeout = self.opts.setup_timeout;
        let thread_name = self.opts.thread_name.clone();
        let core = PumpCore::new(self.source, self.registry, poster, self.opts)
            .with_surface(self.surface)
            .with_encoder(self.encoder)
            .with_error_handler(self.on_error);

        let span = info_span!("decode_pump", pump = %id);
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(core, rx, span))?;

        Ok(DecodePump {
            id,
            tx,
            setup_timeout,
            worker: Some(worker),
        })
    }
}

fn run(mut core: PumpCore, rx: Receiver<Message>, span: Span) {
    let _entered = span.enter();
    info!("decode pump started");

    while let Ok(message) = rx.recv() {
        match message {
            Message::Create { format, reply } => {
                let _ = reply.send(core.create(format));
            }
            Message::Codec { generation, event } => core.handle_event(generation, event),
            Message::Snapshot(reply) => {
                let _ = reply.send(core.snapshot());
            }
            Message::AwaitDone(reply) => core.add_waiter(reply),
            Message::Shutdown => break,
        }
    }

    core.shutdown();
    info!(state = %core.state(), "decode pump stopped");
}
