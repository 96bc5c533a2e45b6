// src/demux.rs

//! Sample source reader built on Symphonia.
//!
//! This module keeps container probing and packet iteration isolated from the decode pump.
//!
//! Responsibilities:
//! - Probe a local container file and describe its tracks
//! - Select the first track of a requested media kind
//! - Hand out one compressed sample at a time, treating container IO end as end-of-stream
//!
//! Audio comes from Symphonia's packet stream. Symphonia does not surface video, so the video
//! tracks of ISO-BMFF files are indexed by `mp4` and read straight from the file.
//!
//! The read cursor follows the usual extractor shape: `read_sample` copies the *current*
//! sample, `advance` moves to the next one and reports whether one exists. The pump relies on
//! that split to notice exhaustion on the same step it submits the last sample.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;
use tracing::{debug, trace};

use crate::format::{FormatDescriptor, MediaKind, UNKNOWN_MIME};
use crate::mp4::{self, Mp4Sample};
use crate::sample::{BufferFlags, SampleInfo};
use crate::{Error, Result};

/// Where the pump pulls compressed samples from.
///
/// All calls happen on the pump's worker thread.
pub trait SampleSource: Send {
    /// Copy the current sample into `buf`. `Ok(None)` means nothing is left.
    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<SampleInfo>>;

    /// Move to the next sample. Returns `false` once the source is exhausted.
    fn advance(&mut self) -> Result<bool>;

    /// Release underlying resources. Must tolerate repeated calls.
    fn release(&mut self);
}

/// Index of a track inside a `SampleReader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackHandle(usize);

impl TrackHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

struct TrackEntry {
    source: TrackSource,
    format: FormatDescriptor,
}

enum TrackSource {
    /// Packets come from Symphonia's interleaved stream.
    Packets { id: u32, time_base: Option<TimeBase> },
    /// Samples are read from the file at indexed offsets.
    Indexed { timescale: u32, samples: Vec<Mp4Sample> },
}

/// Open handles; dropped together on close.
struct Container {
    packets: Option<Box<dyn FormatReader>>,
    file: Option<File>,
}

struct CurrentSample {
    data: Box<[u8]>,
    presentation_time_us: i64,
    flags: BufferFlags,
}

/// A demuxed container plus a read cursor over one selected track.
pub struct SampleReader {
    path: PathBuf,
    // `None` once closed.
    container: Option<Container>,
    tracks: Vec<TrackEntry>,
    selected: Option<usize>,
    // Next sample of an indexed track.
    next_indexed: usize,
    current: Option<CurrentSample>,
}

impl SampleReader {
    /// Probe the container at `path`.
    ///
    /// Fails fast: an unreadable file is `Error::Open`, an unrecognised or corrupt container
    /// (or one without tracks) is `Error::Malformed`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open = |path: &PathBuf| {
            File::open(path).map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })
        };
        let mut file = open(&path)?;

        let iso_bmff = mp4::is_iso_bmff(&mut file).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;

        let (video, video_file) = if iso_bmff {
            let mut video_file = open(&path)?;
            let video = mp4::read_video_tracks(&mut video_file)
                .map_err(|e| Error::Malformed(format!("{}: {e:#}", path.display())))?;
            (video, Some(video_file))
        } else {
            (Vec::new(), None)
        };

        let mss_opts = MediaSourceStreamOptions {
            // Symphonia expects a power-of-two buffer > 32KiB for good probing behavior.
            buffer_len: 256 * 1024,
        };
        let mss = MediaSourceStream::new(Box::new(file), mss_opts);

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts: FormatOptions = Default::default();
        let metadata_opts: MetadataOptions = Default::default();

        let packets = match symphonia::default::get_probe().format(
            &hint,
            mss,
            &format_opts,
            &metadata_opts,
        ) {
            Ok(probed) => Some(probed.format),
            // A video-only file Symphonia cannot read is still usable through the index.
            Err(e) if !video.is_empty() => {
                debug!(path = %path.display(), error = %e, "no audio stream, using video index");
                None
            }
            Err(e) => return Err(Error::Malformed(format!("{}: {e}", path.display()))),
        };

        let mut tracks: Vec<TrackEntry> = packets
            .iter()
            .flat_map(|format| format.tracks())
            .map(|t| TrackEntry {
                source: TrackSource::Packets {
                    id: t.id,
                    time_base: t.codec_params.time_base,
                },
                format: FormatDescriptor::from_track(t),
            })
            // Symphonia lists video tracks it cannot name; the index describes them instead.
            .filter(|t| video.is_empty() || t.format.mime != UNKNOWN_MIME)
            .collect();
        for track in video {
            debug!(
                id = track.track_id,
                mime = %track.format.mime,
                samples = track.samples.len(),
                "indexed video track"
            );
            tracks.push(TrackEntry {
                source: TrackSource::Indexed {
                    timescale: track.timescale,
                    samples: track.samples,
                },
                format: track.format,
            });
        }

        if tracks.is_empty() {
            return Err(Error::Malformed(format!(
                "{}: container declares no tracks",
                path.display()
            )));
        }

        debug!(path = %path.display(), tracks = tracks.len(), "opened media container");

        Ok(Self {
            path,
            container: Some(Container {
                packets,
                file: video_file,
            }),
            tracks,
            selected: None,
            next_indexed: 0,
            current: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track_format(&self, index: usize) -> Option<&FormatDescriptor> {
        self.tracks.get(index).map(|t| &t.format)
    }

    /// Select the first track whose MIME type is of `kind` and prime the cursor on its first
    /// sample.
    pub fn select_track(&mut self, kind: MediaKind) -> Result<TrackHandle> {
        let index = select_track_index(self.tracks.iter().map(|t| t.format.mime.as_str()), kind)
            .ok_or(Error::TrackNotFound(kind))?;

        debug!(index, mime = %self.tracks[index].format.mime, "selected track");

        self.selected = Some(index);
        self.next_indexed = 0;
        self.current = None;
        self.advance()?;
        Ok(TrackHandle(index))
    }

    /// Codec configuration for `track`.
    pub fn format(&self, track: TrackHandle) -> &FormatDescriptor {
        &self.tracks[track.0].format
    }

    /// Copy the current sample into `buf` without moving the cursor.
    ///
    /// A sample larger than `buf` is an error rather than a silent truncation.
    pub fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<SampleInfo>> {
        self.selected.ok_or(Error::NoTrackSelected)?;
        let Some(sample) = self.current.as_ref() else {
            return Ok(None);
        };

        let data = &sample.data;
        if data.len() > buf.len() {
            return Err(Error::BufferTooSmall {
                needed: data.len(),
                capacity: buf.len(),
            });
        }
        buf[..data.len()].copy_from_slice(data);

        Ok(Some(SampleInfo {
            size: data.len(),
            presentation_time_us: sample.presentation_time_us,
            flags: sample.flags,
        }))
    }

    /// Move the cursor to the next sample of the selected track.
    pub fn advance(&mut self) -> Result<bool> {
        let index = self.selected.ok_or(Error::NoTrackSelected)?;
        self.current = None;

        let Some(container) = self.container.as_mut() else {
            return Ok(false);
        };

        self.current = match &self.tracks[index].source {
            TrackSource::Packets { id, time_base } => match container.packets.as_mut() {
                Some(format) => next_track_packet(format, *id)?.map(|packet| CurrentSample {
                    presentation_time_us: ts_to_us(packet.ts(), *time_base),
                    // Symphonia only hands out independently decodable audio packets.
                    flags: BufferFlags::KEY_FRAME,
                    data: packet.data,
                }),
                None => None,
            },
            TrackSource::Indexed { timescale, samples } => {
                match (samples.get(self.next_indexed), container.file.as_mut()) {
                    (Some(sample), Some(file)) => {
                        self.next_indexed += 1;
                        read_indexed(file, sample)?.map(|data| CurrentSample {
                            data,
                            presentation_time_us: mp4::ticks_to_us(sample.pts, *timescale),
                            flags: if sample.sync {
                                BufferFlags::KEY_FRAME
                            } else {
                                BufferFlags::NONE
                            },
                        })
                    }
                    _ => None,
                }
            }
        };

        if let Some(sample) = &self.current {
            trace!(pts = sample.presentation_time_us, len = sample.data.len(), "advanced");
        }
        Ok(self.current.is_some())
    }

    /// Read the current sample and advance past it.
    pub fn next_sample(&mut self, buf: &mut [u8]) -> Result<Option<SampleInfo>> {
        let info = self.read_sample(buf)?;
        if info.is_some() {
            self.advance()?;
        }
        Ok(info)
    }

    /// Whether a track is selected and no sample is left on it.
    pub fn is_exhausted(&self) -> bool {
        self.selected.is_some() && self.current.is_none()
    }

    /// Release the container. Safe to call any number of times.
    pub fn close(&mut self) {
        self.current = None;
        if self.container.take().is_some() {
            debug!(path = %self.path.display(), "released media container");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.container.is_none()
    }
}

impl SampleSource for SampleReader {
    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<SampleInfo>> {
        SampleReader::read_sample(self, buf)
    }

    fn advance(&mut self) -> Result<bool> {
        SampleReader::advance(self)
    }

    fn release(&mut self) {
        self.close();
    }
}

/// Open `path`, select the first track of `kind`, and return its format alongside the reader.
pub fn open_track(
    path: impl AsRef<Path>,
    kind: MediaKind,
) -> Result<(SampleReader, FormatDescriptor)> {
    let mut reader = SampleReader::open(path)?;
    let track = reader.select_track(kind)?;
    let format = reader.format(track).clone();
    Ok((reader, format))
}

/// Position of the first MIME type of `kind`.
pub fn select_track_index<'a>(
    mimes: impl IntoIterator<Item = &'a str>,
    kind: MediaKind,
) -> Option<usize> {
    mimes.into_iter().position(|mime| kind.matches(mime))
}

/// Read the next packet of track `id`, treating IO errors as "end of stream".
///
/// - `Ok(None)` means EOF or stream ended
/// - other errors mean the container is corrupt
fn next_track_packet(format: &mut Box<dyn FormatReader>, id: u32) -> Result<Option<Packet>> {
    loop {
        match format.next_packet() {
            // Ignore packets from other tracks.
            Ok(p) if p.track_id() != id => continue,
            Ok(p) => return Ok(Some(p)),
            Err(SymphoniaError::IoError(_)) => return Ok(None),
            Err(e) => return Err(Error::Malformed(format!("failed reading packet: {e}"))),
        }
    }
}

/// Read one indexed sample. A sample cut off by the end of the file ends the stream.
fn read_indexed(file: &mut File, sample: &Mp4Sample) -> Result<Option<Box<[u8]>>> {
    let mut data = vec![0u8; sample.size as usize];
    let read = file
        .seek(SeekFrom::Start(sample.offset))
        .and_then(|_| file.read_exact(&mut data));

    match read {
        Ok(()) => Ok(Some(data.into_boxed_slice())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(Error::Malformed(format!(
            "failed reading sample at {}: {e}",
            sample.offset
        ))),
    }
}

fn ts_to_us(ts: u64, time_base: Option<TimeBase>) -> i64 {
    match time_base {
        Some(tb) if tb.denom != 0 => {
            (ts as u128 * 1_000_000 * tb.numer as u128 / tb.denom as u128) as i64
        }
        _ => ts as i64,
    }
}
