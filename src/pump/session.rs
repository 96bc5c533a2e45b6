//! The pump's state machine.
//!
//! `PumpCore` owns the codec session, the sample source and the completion flags. It is only
//! ever touched from the worker thread, so none of its state needs locking. Every codec
//! notification arrives as a `CodecEvent` tagged with the generation of the session that
//! produced it; events from retired sessions are dropped.

use std::sync::Arc;
use std::sync::mpsc::SyncSender;

use tracing::{debug, error, info, trace, warn};

use super::state::{Latch, PumpSnapshot, PumpStats, SessionState};
use crate::codec::{
    Codec, CodecError, CodecEvent, CodecRegistry, DownstreamEncoder, EventCallback,
    SharedFrameSink, create_decoder,
};
use crate::demux::SampleSource;
use crate::format::FormatDescriptor;
use crate::opts::PumpOpts;
use crate::sample::BufferInfo;
use crate::{Error, Result};

/// Receives decode-path failures that the pump does not handle itself.
pub type ErrorHandler = Box<dyn FnMut(Error) + Send>;

/// Delivers a codec event, tagged with its session generation, to the worker queue.
pub(crate) type EventPoster = Arc<dyn Fn(u64, CodecEvent) + Send + Sync>;

struct Session {
    codec: Box<dyn Codec>,
    // Kept so a recoverable error can reconfigure with identical parameters.
    format: FormatDescriptor,
    end_of_stream_submitted: bool,
    recovery_attempts: u32,
}

pub(crate) struct PumpCore {
    source: Box<dyn SampleSource>,
    registry: Arc<dyn CodecRegistry>,
    surface: Option<SharedFrameSink>,
    encoder: Option<Arc<dyn DownstreamEncoder>>,
    on_error: Option<ErrorHandler>,
    poster: EventPoster,
    opts: PumpOpts,

    state: SessionState,
    session: Option<Session>,
    generation: u64,
    reader_exhausted: Latch,
    source_released: Latch,
    decoder_finished: Latch,
    output_format: Option<FormatDescriptor>,
    stats: PumpStats,
    failure: Option<String>,
    waiters: Vec<SyncSender<Result<PumpStats>>>,
}

impl PumpCore {
    pub(crate) fn new(
        source: Box<dyn SampleSource>,
        registry: Arc<dyn CodecRegistry>,
        poster: EventPoster,
        opts: PumpOpts,
    ) -> Self {
        Self {
            source,
            registry,
            surface: None,
            encoder: None,
            on_error: None,
            poster,
            opts,
            state: SessionState::Uninitialized,
            session: None,
            generation: 0,
            reader_exhausted: Latch::default(),
            source_released: Latch::default(),
            decoder_finished: Latch::default(),
            output_format: None,
            stats: PumpStats::default(),
            failure: None,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn with_surface(mut self, surface: Option<SharedFrameSink>) -> Self {
        self.surface = surface;
        self
    }

    pub(crate) fn with_encoder(mut self, encoder: Option<Arc<dyn DownstreamEncoder>>) -> Self {
        self.encoder = encoder;
        self
    }

    pub(crate) fn with_error_handler(mut self, on_error: Option<ErrorHandler>) -> Self {
        self.on_error = on_error;
        self
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Set up a codec session for `format`, replacing any live one.
    pub(crate) fn create(&mut self, format: FormatDescriptor) -> Result<()> {
        if self.reader_exhausted.get() {
            return Err(Error::SourceExhausted);
        }

        if self.session.is_some() {
            info!("replacing live codec session");
            self.teardown_session();
        }

        self.generation += 1;
        self.decoder_finished = Latch::default();
        self.state = SessionState::Configuring;
        debug!(mime = %format.mime, generation = self.generation, "configuring codec session");

        let callback = self.session_callback(self.generation);
        match create_decoder(
            self.registry.as_ref(),
            &format,
            self.surface.as_ref(),
            callback,
        ) {
            Some(codec) => {
                info!(codec = codec.name(), mime = %format.mime, "codec session running");
                self.session = Some(Session {
                    codec,
                    format,
                    end_of_stream_submitted: false,
                    recovery_attempts: 0,
                });
                self.state = SessionState::Running;
                self.failure = None;
                Ok(())
            }
            None => {
                let mime = format.mime;
                self.fail(Error::NotSupported { mime: mime.clone() });
                Err(Error::NotSupported { mime })
            }
        }
    }

    /// Dispatch one codec notification.
    pub(crate) fn handle_event(&mut self, generation: u64, event: CodecEvent) {
        if generation != self.generation || self.session.is_none() {
            trace!(
                generation,
                current = self.generation,
                ?event,
                "dropping event from a retired session"
            );
            return;
        }

        let result = match event {
            CodecEvent::InputAvailable(index) => self.on_input_available(index),
            CodecEvent::OutputAvailable { index, info } => self.on_output_available(index, info),
            CodecEvent::FormatChanged(format) => {
                debug!(mime = %format.mime, "output format changed");
                self.output_format = Some(format);
                Ok(())
            }
            CodecEvent::Error(err) => {
                self.on_codec_error(err);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(Error::Codec(err)) => self.on_codec_error(err),
            Err(err) => self.fail(err),
        }
    }

    fn on_input_available(&mut self, index: usize) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.end_of_stream_submitted {
            // Leave the buffer with the codec; nothing more will be queued this session.
            return Ok(());
        }
        if self.reader_exhausted.get() {
            // The last sample took the previous buffer; the marker goes into this one.
            return submit_end_of_stream(session, index);
        }

        let buf = session.codec.input_buffer(index).ok_or_else(|| {
            CodecError::invalid_state(format!("input buffer {index} is not owned by the pump"))
        })?;

        let occupied = match self.source.read_sample(buf)? {
            Some(sample) => {
                trace!(
                    index,
                    size = sample.size,
                    pts = sample.presentation_time_us,
                    "queueing sample"
                );
                session.codec.queue_input_buffer(index, sample.into())?;
                self.stats.samples_submitted += 1;
                true
            }
            None => false,
        };

        if !self.source.advance()? {
            self.reader_exhausted.set();
            debug!(samples = self.stats.samples_submitted, "sample source exhausted");
            if self.source_released.set() {
                self.source.release();
            }
            if !occupied {
                submit_end_of_stream(session, index)?;
            }
        }

        Ok(())
    }

    fn on_output_available(&mut self, index: usize, info: BufferInfo) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if info.is_codec_config() && !info.is_end_of_stream() {
            trace!(index, "dropping codec config buffer");
            session.codec.release_output_buffer(index, false)?;
            self.stats.buffers_dropped += 1;
            return Ok(());
        }

        let render = info.size != 0 && !info.is_codec_config();
        session.codec.release_output_buffer(index, render)?;
        if render {
            self.stats.buffers_rendered += 1;
            session.recovery_attempts = 0;
        } else {
            self.stats.buffers_dropped += 1;
        }

        if info.is_end_of_stream() {
            self.finish();
        }
        Ok(())
    }

    fn on_codec_error(&mut self, err: CodecError) {
        if err.recoverable {
            let attempts = self.session.as_ref().map_or(0, |s| s.recovery_attempts);
            if attempts >= self.opts.max_recovery_attempts {
                self.fail(Error::RecoveryExhausted { attempts, last: err });
                return;
            }

            warn!(error = %err, attempt = attempts + 1, "restarting codec session");
            if let Err(restart_err) = self.restart_session() {
                self.fail(Error::Codec(restart_err));
            }
        } else if !err.transient {
            self.fail(Error::Codec(err));
        } else {
            debug!(error = %err, "ignoring transient codec error");
        }
    }

    /// Stop, reconfigure with the same parameters, and start again.
    fn restart_session(&mut self) -> std::result::Result<(), CodecError> {
        self.generation += 1;
        let callback = self.session_callback(self.generation);
        let surface = self.surface.clone();

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.recovery_attempts += 1;
        // Whatever was in flight, the end-of-stream marker included, is gone.
        session.end_of_stream_submitted = false;
        self.stats.recoveries += 1;

        session.codec.stop()?;
        session.codec.set_callback(callback);
        session.codec.configure(&session.format, surface)?;
        session.codec.start()
    }

    fn finish(&mut self) {
        if !self.decoder_finished.set() {
            return;
        }

        self.state = SessionState::Draining;
        self.teardown_session();
        self.state = SessionState::Stopped;
        info!(stats = ?self.stats, "decoder finished");

        if let Some(encoder) = &self.encoder {
            encoder.signal_end_of_input_stream();
        }

        let stats = self.stats;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(stats));
        }
    }

    fn fail(&mut self, err: Error) {
        error!(error = %err, "decode pump failed");
        self.teardown_session();
        self.state = SessionState::Failed;

        let message = err.to_string();
        if let Some(handler) = self.on_error.as_mut() {
            handler(err);
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::Failed(message.clone())));
        }
        self.failure = Some(message);
    }

    fn teardown_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        // Anything the old session still has queued is now stale.
        self.generation += 1;

        if let Err(err) = session.codec.stop() {
            warn!(codec = session.codec.name(), error = %err, "codec stop failed during teardown");
        }
        session.codec.release();
        debug!(codec = session.codec.name(), "codec session released");
    }

    fn session_callback(&self, generation: u64) -> EventCallback {
        let poster = self.poster.clone();
        Arc::new(move |event| poster(generation, event))
    }

    /// Register a caller waiting for the end of decoding.
    pub(crate) fn add_waiter(&mut self, waiter: SyncSender<Result<PumpStats>>) {
        match self.state {
            SessionState::Stopped => {
                let _ = waiter.send(Ok(self.stats));
            }
            SessionState::Failed => {
                let message = self
                    .failure
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string());
                let _ = waiter.send(Err(Error::Failed(message)));
            }
            _ => self.waiters.push(waiter),
        }
    }

    pub(crate) fn snapshot(&self) -> PumpSnapshot {
        PumpSnapshot {
            state: self.state,
            codec_name: self.session.as_ref().map(|s| s.codec.name().to_string()),
            reader_exhausted: self.reader_exhausted.get(),
            end_of_stream_submitted: self
                .session
                .as_ref()
                .map_or(self.decoder_finished.get(), |s| s.end_of_stream_submitted),
            decoder_finished: self.decoder_finished.get(),
            output_format: self.output_format.clone(),
            stats: self.stats,
        }
    }

    /// Release the session and the source. Pending waiters see their reply channel close.
    pub(crate) fn shutdown(&mut self) {
        self.teardown_session();
        if self.source_released.set() {
            self.source.release();
        }
        self.waiters.clear();
    }
}

fn submit_end_of_stream(session: &mut Session, index: usize) -> Result<()> {
    session
        .codec
        .queue_input_buffer(index, BufferInfo::end_of_stream())?;
    session.end_of_stream_submitted = true;
    debug!(index, "queued end-of-stream marker");
    Ok(())
}
