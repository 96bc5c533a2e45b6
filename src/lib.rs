//! `compressor`: feed demuxed media samples through an asynchronous codec session.
//!
//! This crate provides:
//! - A container reader that walks one selected track sample by sample, with MP4 video tracks
//!   indexed directly from the sample tables
//! - A codec seam modelled on the buffer-exchange protocol (free inputs and ready outputs are
//!   announced by the codec, and the client queues input and releases output)
//! - The decode pump, which owns a codec session on a worker thread, pulls samples into it,
//!   signals end-of-stream, recovers from codec errors, and tells the downstream encoder when
//!   decoding is done
//! - Symphonia-backed software audio decoders
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use compressor::backends::SymphoniaRegistry;
//! use compressor::{DecodePump, MediaKind, open_track};
//!
//! # fn main() -> compressor::Result<()> {
//! let (reader, format) = open_track("input.wav", MediaKind::Audio)?;
//! let pump = DecodePump::builder(reader, Arc::new(SymphoniaRegistry::new())).spawn()?;
//! pump.create(format)?;
//! let stats = pump.wait_until_done()?;
//! println!("rendered {} buffers", stats.buffers_rendered);
//! # Ok(())
//! # }
//! ```

// Sample source: container reading and track selection.
pub mod demux;
pub mod format;
pub mod sample;

// Codec seam and built-in implementations.
pub mod backends;
pub mod codec;

// Decode pump and its configuration.
pub mod opts;
pub mod pump;

mod error;
mod mp4;
mod pcm;

// Logging configuration.
#[cfg(feature = "logging")]
pub mod logging;

#[cfg(test)]
mod testing;

pub use codec::{
    Codec, CodecError, CodecErrorKind, CodecEvent, CodecInfo, CodecRegistry, DecodedFrame,
    DownstreamEncoder, EventCallback, FrameSink, SharedFrameSink, create_decoder,
};
pub use demux::{SampleReader, SampleSource, TrackHandle, open_track};
pub use error::{Error, Result};
pub use format::{FormatDescriptor, MediaKind};
pub use opts::PumpOpts;
pub use pump::{DecodePump, DecodePumpBuilder, PumpSnapshot, PumpStats, SessionState};
pub use sample::{BufferFlags, BufferInfo, SampleInfo};
