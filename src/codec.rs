// src/codec.rs

//! The codec seam: what a decoder implementation must look like to be driven by the pump.
//!
//! A codec exchanges buffers asynchronously. It announces free input buffers and filled output
//! buffers through an `EventCallback`; the pump answers by queueing input and releasing output.
//! Implementations are enumerated through a `CodecRegistry`.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::format::FormatDescriptor;
use crate::sample::BufferInfo;

/// Broad cause of a codec failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    /// A single unit of media could not be decoded.
    Decode,
    /// The codec lost its internal state and needs to be restarted.
    Reset,
    /// The format or its parameters are not acceptable.
    Unsupported,
    /// A call arrived in the wrong lifecycle state or with a bad buffer index.
    InvalidState,
    /// Anything else reported by the implementation.
    Internal,
}

impl fmt::Display for CodecErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecErrorKind::Decode => "decode",
            CodecErrorKind::Reset => "reset",
            CodecErrorKind::Unsupported => "unsupported",
            CodecErrorKind::InvalidState => "invalid state",
            CodecErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Structured codec failure.
///
/// `recoverable` means the session can heal with a stop/configure/start cycle. `transient` means
/// the implementation expects the condition to pass by itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("codec {kind} error: {message}")]
pub struct CodecError {
    pub kind: CodecErrorKind,
    pub recoverable: bool,
    pub transient: bool,
    pub message: String,
}

impl CodecError {
    /// A non-recoverable, non-transient error.
    pub fn fatal(kind: CodecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            recoverable: false,
            transient: false,
            message: message.into(),
        }
    }

    pub fn recoverable(kind: CodecErrorKind, message: impl Into<String>) -> Self {
        Self {
            recoverable: true,
            ..Self::fatal(kind, message)
        }
    }

    pub fn transient(kind: CodecErrorKind, message: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::fatal(kind, message)
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::fatal(CodecErrorKind::InvalidState, message)
    }
}

/// Asynchronous notifications emitted by a codec.
#[derive(Debug, Clone)]
pub enum CodecEvent {
    /// Input buffer `index` is free to be filled and queued.
    InputAvailable(usize),
    /// Output buffer `index` is ready; it must be released exactly once.
    OutputAvailable { index: usize, info: BufferInfo },
    /// The output format changed (or became known).
    FormatChanged(FormatDescriptor),
    Error(CodecError),
}

/// Callback a codec uses to post events. Must not block.
pub type EventCallback = Arc<dyn Fn(CodecEvent) + Send + Sync>;

/// One decoded unit, as handed to the output target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    pub presentation_time_us: i64,
    pub sample_rate: u32,
    pub channels: usize,
    /// Interleaved samples.
    pub samples: Vec<f32>,
}

/// Output target that receives rendered frames.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &DecodedFrame);
}

pub type SharedFrameSink = Arc<dyn FrameSink>;

/// The downstream encoder, told once that no more input is coming.
pub trait DownstreamEncoder: Send + Sync {
    fn signal_end_of_input_stream(&self);
}

/// A codec instance driven through the buffer-exchange protocol.
///
/// Lifecycle: `configure` → `start` → (buffer exchange) → `stop` → `configure` again or
/// `release`. After `release` the instance is unusable.
pub trait Codec: Send {
    fn name(&self) -> &str;

    /// Install the event callback. Must be called before `configure`.
    fn set_callback(&mut self, callback: EventCallback);

    fn configure(
        &mut self,
        format: &FormatDescriptor,
        surface: Option<SharedFrameSink>,
    ) -> Result<(), CodecError>;

    /// Begin the exchange; the codec announces its input buffers after this.
    fn start(&mut self) -> Result<(), CodecError>;

    /// Drop all in-flight buffers and return to the unconfigured state.
    fn stop(&mut self) -> Result<(), CodecError>;

    fn release(&mut self);

    /// Writable view of input buffer `index`, if that buffer is owned by the caller.
    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]>;

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> Result<(), CodecError>;

    /// Hand output buffer `index` back, forwarding it to the surface when `render` is set.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError>;
}

/// Static description of one codec implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub name: String,
    pub is_encoder: bool,
    pub supported_types: Vec<String>,
}

impl CodecInfo {
    pub fn decoder(name: impl Into<String>, supported_types: &[&str]) -> Self {
        Self {
            name: name.into(),
            is_encoder: false,
            supported_types: supported_types.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn supports_type(&self, mime: &str) -> bool {
        self.supported_types.iter().any(|t| t == mime)
    }
}

/// Enumerates and instantiates codec implementations.
pub trait CodecRegistry: Send + Sync {
    fn codec_infos(&self) -> Vec<CodecInfo>;

    /// Whether `info` can handle `format`. An error means the question does not apply
    /// (e.g. the implementation does not handle that MIME type at all).
    fn is_format_supported(
        &self,
        info: &CodecInfo,
        format: &FormatDescriptor,
    ) -> Result<bool, CodecError>;

    fn create_by_name(&self, name: &str) -> Result<Box<dyn Codec>, CodecError>;
}

/// Find the first decoder that accepts `format`, configure it against `surface`, and start it.
///
/// Implementations that reject the format, fail to instantiate, configure, or start are skipped
/// (and released if they were created). `None` means no implementation worked.
pub fn create_decoder(
    registry: &dyn CodecRegistry,
    format: &FormatDescriptor,
    surface: Option<&SharedFrameSink>,
    callback: EventCallback,
) -> Option<Box<dyn Codec>> {
    for info in registry.codec_infos() {
        if info.is_encoder || !info.supports_type(&format.mime) {
            continue;
        }

        match registry.is_format_supported(&info, format) {
            Ok(true) => {}
            Ok(false) => {
                debug!(codec = %info.name, mime = %format.mime, "codec rejects format");
                continue;
            }
            Err(err) => {
                debug!(codec = %info.name, error = %err, "capability query failed");
                continue;
            }
        }

        let mut codec = match registry.create_by_name(&info.name) {
            Ok(codec) => codec,
            Err(err) => {
                debug!(codec = %info.name, error = %err, "failed to instantiate codec");
                continue;
            }
        };

        codec.set_callback(callback.clone());

        if let Err(err) = codec.configure(format, surface.cloned()) {
            debug!(codec = %info.name, error = %err, "failed to configure codec");
            codec.release();
            continue;
        }

        if let Err(err) = codec.start() {
            debug!(codec = %info.name, error = %err, "failed to start codec");
            codec.release();
            continue;
        }

        debug!(codec = %info.name, mime = %format.mime, "codec started");
        return Some(codec);
    }

    None
}
