// src/backends/software.rs

//! Software audio decoders backed by Symphonia.
//!
//! `SymphoniaRegistry` exposes one decoder entry per MIME type Symphonia can name. Each entry
//! produces a `SymphoniaCodec`, which plays the buffer-exchange protocol on top of a plain
//! synchronous Symphonia decoder: packets are decoded as soon as they are queued, and the
//! resulting events go out through the installed callback.
//!
//! Error policy (mirrors how Symphonia reports trouble):
//! - `DecodeError` / `IoError` → transient (skip that packet)
//! - `ResetRequired`           → recoverable (the session must be restarted)
//! - anything else             → fatal

use anyhow::{Context, anyhow};
use symphonia::core::audio::SignalSpec;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use tracing::trace;

use crate::codec::{
    Codec, CodecError, CodecErrorKind, CodecEvent, CodecInfo, CodecRegistry, DecodedFrame,
    EventCallback, SharedFrameSink,
};
use crate::format::{FormatDescriptor, mime_for_codec};
use crate::pcm::Interleaver;
use crate::sample::{BufferFlags, BufferInfo};

/// Input buffers each codec announces unless configured otherwise.
pub const DEFAULT_INPUT_BUFFERS: usize = 4;

const DECODERS: &[(&str, &str)] = &[
    ("symphonia.raw", "audio/raw"),
    ("symphonia.mpeg", "audio/mpeg"),
    ("symphonia.aac", "audio/mp4a-latm"),
    ("symphonia.flac", "audio/flac"),
    ("symphonia.vorbis", "audio/vorbis"),
    ("symphonia.alac", "audio/alac"),
    ("symphonia.opus", "audio/opus"),
];

/// Registry of Symphonia-backed software decoders.
#[derive(Debug, Clone)]
pub struct SymphoniaRegistry {
    input_buffers: usize,
}

impl Default for SymphoniaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SymphoniaRegistry {
    pub fn new() -> Self {
        Self {
            input_buffers: DEFAULT_INPUT_BUFFERS,
        }
    }

    /// Number of input buffers each created codec cycles through (at least one).
    pub fn with_input_buffers(mut self, count: usize) -> Self {
        self.input_buffers = count.max(1);
        self
    }
}

impl CodecRegistry for SymphoniaRegistry {
    fn codec_infos(&self) -> Vec<CodecInfo> {
        DECODERS
            .iter()
            .map(|(name, mime)| CodecInfo::decoder(*name, &[*mime]))
            .collect()
    }

    fn is_format_supported(
        &self,
        info: &CodecInfo,
        format: &FormatDescriptor,
    ) -> Result<bool, CodecError> {
        if !info.supports_type(&format.mime) {
            return Err(CodecError::fatal(
                CodecErrorKind::Unsupported,
                format!("{} does not decode {}", info.name, format.mime),
            ));
        }

        // Without Symphonia parameters there is nothing to build a decoder from.
        let Some(params) = &format.codec_params else {
            return Ok(false);
        };
        if mime_for_codec(params.codec) != format.mime {
            return Ok(false);
        }

        Ok(symphonia::default::get_codecs()
            .get_codec(params.codec)
            .is_some())
    }

    fn create_by_name(&self, name: &str) -> Result<Box<dyn Codec>, CodecError> {
        DECODERS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(n, _)| Box::new(SymphoniaCodec::new(*n, self.input_buffers)) as Box<dyn Codec>)
            .ok_or_else(|| {
                CodecError::fatal(CodecErrorKind::Unsupported, format!("unknown codec {name}"))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Configured,
    Running,
    Released,
}

/// A Symphonia decoder speaking the asynchronous buffer-exchange protocol.
pub struct SymphoniaCodec {
    name: String,
    input_count: usize,
    lifecycle: Lifecycle,
    callback: Option<EventCallback>,
    surface: Option<SharedFrameSink>,
    decoder: Option<Box<dyn Decoder>>,
    inputs: Vec<Vec<u8>>,
    // Whether the client currently owns each input buffer.
    owned: Vec<bool>,
    // Decoded frames waiting for `release_output_buffer`; `None` marks a free slot.
    outputs: Vec<Option<DecodedFrame>>,
    interleaver: Interleaver,
    output_spec: Option<SignalSpec>,
}

impl SymphoniaCodec {
    pub fn new(name: impl Into<String>, input_count: usize) -> Self {
        Self {
            name: name.into(),
            input_count: input_count.max(1),
            lifecycle: Lifecycle::Uninitialized,
            callback: None,
            surface: None,
            decoder: None,
            inputs: Vec::new(),
            owned: Vec::new(),
            outputs: Vec::new(),
            interleaver: Interleaver::default(),
            output_spec: None,
        }
    }

    fn emit(&self, event: CodecEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }

    fn give_back_input(&mut self, index: usize) {
        self.owned[index] = true;
        self.emit(CodecEvent::InputAvailable(index));
    }

    fn push_output(&mut self, frame: DecodedFrame, info: BufferInfo) {
        let index = match self.outputs.iter().position(Option::is_none) {
            Some(free) => {
                self.outputs[free] = Some(frame);
                free
            }
            None => {
                self.outputs.push(Some(frame));
                self.outputs.len() - 1
            }
        };
        self.emit(CodecEvent::OutputAvailable { index, info });
    }

    fn decode_input(&mut self, index: usize, info: BufferInfo) {
        let data = &self.inputs[index][info.offset..info.offset + info.size];
        let ts = info.presentation_time_us.max(0) as u64;
        let packet = Packet::new_from_slice(0, ts, 0, data);

        let Some(decoder) = self.decoder.as_mut() else {
            self.emit(CodecEvent::Error(CodecError::invalid_state(
                "no decoder configured",
            )));
            return;
        };

        match decode_packet(decoder, &mut self.interleaver, &packet) {
            Ok((samples, spec)) => {
                if self.output_spec != Some(spec) {
                    self.output_spec = Some(spec);
                    self.emit(CodecEvent::FormatChanged(raw_format(spec)));
                }

                trace!(pts = info.presentation_time_us, samples = samples.len(), "decoded packet");
                let size = samples.len() * std::mem::size_of::<f32>();
                let frame = DecodedFrame {
                    presentation_time_us: info.presentation_time_us,
                    sample_rate: spec.rate,
                    channels: spec.channels.count(),
                    samples,
                };
                self.push_output(
                    frame,
                    BufferInfo::new(size, info.presentation_time_us, BufferFlags::NONE),
                );
            }
            Err(err) => self.emit(CodecEvent::Error(err)),
        }
    }

    fn check_input(&self, index: usize, info: &BufferInfo) -> Result<(), CodecError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(CodecError::invalid_state(format!(
                "{}: queue_input_buffer while {:?}",
                self.name, self.lifecycle
            )));
        }
        if !self.owned.get(index).copied().unwrap_or(false) {
            return Err(CodecError::invalid_state(format!(
                "{}: input buffer {index} is not owned by the client",
                self.name
            )));
        }
        if info.offset + info.size > self.inputs[index].len() {
            return Err(CodecError::invalid_state(format!(
                "{}: range {}+{} exceeds input buffer {index}",
                self.name, info.offset, info.size
            )));
        }
        Ok(())
    }
}

impl Codec for SymphoniaCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_callback(&mut self, callback: EventCallback) {
        self.callback = Some(callback);
    }

    fn configure(
        &mut self,
        format: &FormatDescriptor,
        surface: Option<SharedFrameSink>,
    ) -> Result<(), CodecError> {
        if self.lifecycle != Lifecycle::Uninitialized {
            return Err(CodecError::invalid_state(format!(
                "{}: configure while {:?}",
                self.name, self.lifecycle
            )));
        }

        let params = format.codec_params.as_ref().ok_or_else(|| {
            CodecError::fatal(
                CodecErrorKind::Unsupported,
                format!("{}: format carries no codec parameters", format.mime),
            )
        })?;
        let decoder = make_decoder(params).map_err(|e| {
            CodecError::fatal(CodecErrorKind::Unsupported, format!("{e:#}"))
        })?;

        self.decoder = Some(decoder);
        self.surface = surface;
        self.inputs = vec![vec![0; format.max_input_size]; self.input_count];
        self.owned = vec![false; self.input_count];
        self.outputs.clear();
        self.output_spec = None;
        self.lifecycle = Lifecycle::Configured;
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.lifecycle != Lifecycle::Configured {
            return Err(CodecError::invalid_state(format!(
                "{}: start while {:?}",
                self.name, self.lifecycle
            )));
        }
        self.lifecycle = Lifecycle::Running;
        for index in 0..self.input_count {
            self.give_back_input(index);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        match self.lifecycle {
            Lifecycle::Configured | Lifecycle::Running => {}
            other => {
                return Err(CodecError::invalid_state(format!(
                    "{}: stop while {other:?}",
                    self.name
                )));
            }
        }
        self.decoder = None;
        self.outputs.clear();
        self.owned.iter_mut().for_each(|o| *o = false);
        self.lifecycle = Lifecycle::Uninitialized;
        Ok(())
    }

    fn release(&mut self) {
        self.lifecycle = Lifecycle::Released;
        self.decoder = None;
        self.surface = None;
        self.callback = None;
        self.inputs.clear();
        self.owned.clear();
        self.outputs.clear();
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]> {
        if self.lifecycle != Lifecycle::Running || !self.owned.get(index).copied().unwrap_or(false)
        {
            return None;
        }
        Some(&mut self.inputs[index][..])
    }

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> Result<(), CodecError> {
        self.check_input(index, &info)?;
        self.owned[index] = false;

        if info.is_codec_config() {
            // Setup data already travels in the codec parameters.
            self.give_back_input(index);
            return Ok(());
        }

        if info.size > 0 {
            self.decode_input(index, info);
        }

        if info.is_end_of_stream() {
            // Symphonia decoders hold no delayed frames, so the stream is drained right away.
            self.push_output(
                DecodedFrame {
                    presentation_time_us: info.presentation_time_us,
                    ..DecodedFrame::default()
                },
                BufferInfo::new(0, info.presentation_time_us, BufferFlags::END_OF_STREAM),
            );
            return Ok(());
        }

        self.give_back_input(index);
        Ok(())
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(CodecError::invalid_state(format!(
                "{}: release_output_buffer while {:?}",
                self.name, self.lifecycle
            )));
        }
        let frame = self
            .outputs
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| {
                CodecError::invalid_state(format!("{}: unknown output buffer {index}", self.name))
            })?;

        if render {
            if let Some(surface) = &self.surface {
                surface.on_frame(&frame);
            }
        }
        Ok(())
    }
}

/// Create a decoder for the given codec parameters from Symphonia's default registry.
fn make_decoder(params: &CodecParameters) -> anyhow::Result<Box<dyn Decoder>> {
    let decoder_opts: DecoderOptions = Default::default();

    symphonia::default::get_codecs()
        .make(params, &decoder_opts)
        .map_err(|e| anyhow!(e))
        .context("failed to create decoder for track")
}

/// Decode one packet into interleaved `f32`, classifying failures by severity.
fn decode_packet(
    decoder: &mut Box<dyn Decoder>,
    interleaver: &mut Interleaver,
    packet: &Packet,
) -> Result<(Vec<f32>, SignalSpec), CodecError> {
    match decoder.decode(packet) {
        Ok(decoded) => interleaver.interleave(&decoded).map_err(|e| {
            CodecError::fatal(CodecErrorKind::Internal, format!("{e:#}"))
        }),

        // Corrupted frame, but decoding can continue.
        Err(SymphoniaError::DecodeError(msg)) => {
            Err(CodecError::transient(CodecErrorKind::Decode, msg))
        }
        Err(SymphoniaError::IoError(e)) => Err(CodecError::transient(
            CodecErrorKind::Decode,
            e.to_string(),
        )),

        Err(SymphoniaError::ResetRequired) => Err(CodecError::recoverable(
            CodecErrorKind::Reset,
            "decoder requires a reset",
        )),

        Err(e) => Err(CodecError::fatal(CodecErrorKind::Internal, e.to_string())),
    }
}

fn raw_format(spec: SignalSpec) -> FormatDescriptor {
    FormatDescriptor {
        sample_rate: Some(spec.rate),
        channels: Some(spec.channels.count()),
        bits_per_sample: Some(32),
        ..FormatDescriptor::new("audio/raw")
    }
}
