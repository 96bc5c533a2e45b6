// src/format.rs

//! Track and codec format descriptors.
//!
//! A `FormatDescriptor` is what the reader hands to the pump and what the pump hands to
//! a codec at configuration time. It is keyed by a MIME type (`audio/flac`, `video/avc`, ...)
//! so codec registries can match on it without knowing the container.

use std::fmt;

use symphonia::core::codecs::{self, CodecParameters, CodecType};
use symphonia::core::formats::Track;

/// Upper bound for a single compressed sample when the container does not say.
pub const DEFAULT_MAX_INPUT_SIZE: usize = 1024 * 1024;

/// MIME type used for tracks whose codec we cannot name.
pub const UNKNOWN_MIME: &str = "application/octet-stream";

/// Broad media category of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// The MIME prefix shared by every track of this kind.
    pub fn mime_prefix(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio/",
            MediaKind::Video => "video/",
        }
    }

    /// Whether `mime` declares a track of this kind.
    pub fn matches(self, mime: &str) -> bool {
        mime.starts_with(self.mime_prefix())
    }

    /// Classify a MIME type, if it is audio or video at all.
    pub fn of_mime(mime: &str) -> Option<Self> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .find(|kind| kind.matches(mime))
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Codec configuration for one track.
#[derive(Debug, Clone)]
pub struct FormatDescriptor {
    /// MIME type, e.g. `audio/flac`.
    pub mime: String,

    pub sample_rate: Option<u32>,
    pub channels: Option<usize>,
    pub bits_per_sample: Option<u32>,

    /// Coded picture size of a video track.
    pub width: Option<u32>,
    pub height: Option<u32>,

    /// Track duration in microseconds, when the container declares it.
    pub duration_us: Option<i64>,

    /// Capacity every codec input buffer must have for this track.
    pub max_input_size: usize,

    /// Codec-private setup data (e.g. an AAC AudioSpecificConfig or an `avcC` record).
    pub extra_data: Option<Box<[u8]>>,

    /// Raw Symphonia parameters, present when the descriptor came from `SampleReader`.
    pub codec_params: Option<CodecParameters>,
}

impl FormatDescriptor {
    /// A bare descriptor with only a MIME type set.
    pub fn new(mime: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            sample_rate: None,
            channels: None,
            bits_per_sample: None,
            width: None,
            height: None,
            duration_us: None,
            max_input_size: DEFAULT_MAX_INPUT_SIZE,
            extra_data: None,
            codec_params: None,
        }
    }

    /// Build a descriptor from a Symphonia track.
    pub fn from_track(track: &Track) -> Self {
        let params = &track.codec_params;

        let duration_us = match (params.n_frames, params.sample_rate) {
            (Some(frames), Some(rate)) if rate > 0 => {
                Some((frames as i128 * 1_000_000 / rate as i128) as i64)
            }
            _ => None,
        };

        Self {
            mime: mime_for_codec(params.codec).to_string(),
            sample_rate: params.sample_rate,
            channels: params.channels.map(|c| c.count()),
            bits_per_sample: params.bits_per_sample,
            width: None,
            height: None,
            duration_us,
            max_input_size: DEFAULT_MAX_INPUT_SIZE,
            extra_data: params.extra_data.clone(),
            codec_params: Some(params.clone()),
        }
    }

    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::of_mime(&self.mime)
    }
}

/// Map a Symphonia codec id onto the MIME type registries match against.
///
/// Symphonia only decodes audio, so video tracks of MP4 files are named by `mp4` instead.
pub fn mime_for_codec(codec: CodecType) -> &'static str {
    match codec {
        codecs::CODEC_TYPE_MP1 | codecs::CODEC_TYPE_MP2 | codecs::CODEC_TYPE_MP3 => "audio/mpeg",
        codecs::CODEC_TYPE_AAC => "audio/mp4a-latm",
        codecs::CODEC_TYPE_FLAC => "audio/flac",
        codecs::CODEC_TYPE_VORBIS => "audio/vorbis",
        codecs::CODEC_TYPE_OPUS => "audio/opus",
        codecs::CODEC_TYPE_ALAC => "audio/alac",
        codecs::CODEC_TYPE_WAVPACK => "audio/x-wavpack",
        c if is_pcm(c) => "audio/raw",
        _ => UNKNOWN_MIME,
    }
}

/// Whether `codec` is one of the uncompressed or companded PCM variants.
pub(crate) fn is_pcm(codec: CodecType) -> bool {
    PCM_CODECS.contains(&codec)
}

const PCM_CODECS: &[CodecType] = &[
    codecs::CODEC_TYPE_PCM_S8,
    codecs::CODEC_TYPE_PCM_U8,
    codecs::CODEC_TYPE_PCM_S16LE,
    codecs::CODEC_TYPE_PCM_S16BE,
    codecs::CODEC_TYPE_PCM_U16LE,
    codecs::CODEC_TYPE_PCM_U16BE,
    codecs::CODEC_TYPE_PCM_S24LE,
    codecs::CODEC_TYPE_PCM_S24BE,
    codecs::CODEC_TYPE_PCM_U24LE,
    codecs::CODEC_TYPE_PCM_U24BE,
    codecs::CODEC_TYPE_PCM_S32LE,
    codecs::CODEC_TYPE_PCM_S32BE,
    codecs::CODEC_TYPE_PCM_U32LE,
    codecs::CODEC_TYPE_PCM_U32BE,
    codecs::CODEC_TYPE_PCM_F32LE,
    codecs::CODEC_TYPE_PCM_F32BE,
    codecs::CODEC_TYPE_PCM_F64LE,
    codecs::CODEC_TYPE_PCM_F64BE,
    codecs::CODEC_TYPE_PCM_ALAW,
    codecs::CODEC_TYPE_PCM_MULAW,
];
