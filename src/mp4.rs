//! Video track index for ISO-BMFF (MP4/MOV) files.
//!
//! Symphonia only surfaces the audio tracks of an MP4 file. This module walks the `moov` box,
//! names each video track's codec from its sample entry, and flattens the sample tables into
//! one list of (offset, size, timestamp, sync) entries per track. Sample payloads are read
//! later, one at a time, by the reader.

use std::io::{self, Read, Seek, SeekFrom};

use anyhow::{Context, Result, bail, ensure};
use tracing::debug;

use crate::format::{DEFAULT_MAX_INPUT_SIZE, FormatDescriptor};

type FourCc = [u8; 4];

// `moov` is read into memory in one piece.
const MAX_MOOV_SIZE: u64 = 64 * 1024 * 1024;
const MAX_SAMPLES: usize = 1 << 24;

/// One sample of a video track, in decode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mp4Sample {
    pub offset: u64,
    pub size: u32,
    /// Presentation time in track timescale units.
    pub pts: i64,
    pub sync: bool,
}

/// A video track found in the `moov` box.
#[derive(Debug, Clone)]
pub(crate) struct VideoTrack {
    pub track_id: u32,
    pub timescale: u32,
    pub format: FormatDescriptor,
    pub samples: Vec<Mp4Sample>,
}

/// Whether the stream starts with an `ftyp` box. The position is restored.
pub(crate) fn is_iso_bmff<R: Read + Seek>(reader: &mut R) -> io::Result<bool> {
    let mut header = [0u8; 8];
    let found = match reader.read_exact(&mut header) {
        Ok(()) => &header[4..8] == b"ftyp",
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e),
    };
    reader.seek(SeekFrom::Start(0))?;
    Ok(found)
}

/// Index every video track with a recognised sample entry.
pub(crate) fn read_video_tracks<R: Read + Seek>(reader: &mut R) -> Result<Vec<VideoTrack>> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let mut pos = reader.seek(SeekFrom::Start(0))?;

    while pos + 8 <= file_len {
        let mut header = [0u8; 8];
        reader.read_exact(&mut header).context("reading box header")?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let fourcc: FourCc = [header[4], header[5], header[6], header[7]];

        let (size, header_len) = match size32 {
            0 => (file_len - pos, 8),
            1 => {
                let mut large = [0u8; 8];
                reader.read_exact(&mut large).context("reading large box size")?;
                (u64::from_be_bytes(large), 16)
            }
            n => (n, 8),
        };
        ensure!(
            size >= header_len && pos + size <= file_len,
            "box '{}' at {pos} overruns the file",
            fourcc_str(fourcc)
        );

        if &fourcc == b"moov" {
            let body_len = size - header_len;
            ensure!(body_len <= MAX_MOOV_SIZE, "moov box of {body_len} bytes is too large");
            let mut body = vec![0u8; body_len as usize];
            reader.read_exact(&mut body).context("reading moov box")?;
            return parse_moov(Bytes::new(&body));
        }

        pos = reader.seek(SeekFrom::Start(pos + size))?;
    }

    bail!("no moov box found")
}

fn parse_moov(mut moov: Bytes<'_>) -> Result<Vec<VideoTrack>> {
    let mut tracks = Vec::new();
    while let Some((fourcc, body)) = moov.next_box()? {
        if &fourcc == b"trak" {
            if let Some(track) = parse_trak(body)? {
                tracks.push(track);
            }
        }
    }
    Ok(tracks)
}

#[derive(Default)]
struct Trak {
    track_id: u32,
    timescale: u32,
    duration: u64,
    handler: FourCc,
    tables: SampleTables,
}

#[derive(Default)]
struct SampleTables {
    entry: Option<VisualEntry>,
    sizes: Vec<u32>,
    chunk_offsets: Vec<u64>,
    // (first_chunk, samples_per_chunk)
    sample_to_chunk: Vec<(u32, u32)>,
    // (sample_count, delta)
    time_to_sample: Vec<(u32, u32)>,
    // (sample_count, offset)
    composition_offsets: Vec<(u32, i64)>,
    // 1-based; `None` means every sample is a sync sample.
    sync_samples: Option<Vec<u32>>,
}

struct VisualEntry {
    fourcc: FourCc,
    width: u16,
    height: u16,
    config: Option<Box<[u8]>>,
}

fn parse_trak(mut trak: Bytes<'_>) -> Result<Option<VideoTrack>> {
    let mut parts = Trak::default();

    while let Some((fourcc, mut body)) = trak.next_box()? {
        match &fourcc {
            b"tkhd" => {
                let version = body.full_header()?;
                body.skip(if version == 1 { 16 } else { 8 })?;
                parts.track_id = body.u32()?;
            }
            b"mdia" => parse_mdia(body, &mut parts)?,
            _ => {}
        }
    }

    if &parts.handler != b"vide" {
        return Ok(None);
    }
    let Some(entry) = parts.tables.entry.take() else {
        debug!(track = parts.track_id, "video track without a usable sample entry");
        return Ok(None);
    };
    let Some(mime) = video_mime(entry.fourcc) else {
        debug!(
            track = parts.track_id,
            entry = %fourcc_str(entry.fourcc),
            "unrecognised video codec"
        );
        return Ok(None);
    };
    ensure!(parts.timescale != 0, "track {} has a zero timescale", parts.track_id);

    let samples = flatten(&parts.tables)
        .with_context(|| format!("sample table of track {}", parts.track_id))?;
    let largest = samples.iter().map(|s| s.size as usize).max().unwrap_or(0);

    let format = FormatDescriptor {
        width: Some(entry.width as u32),
        height: Some(entry.height as u32),
        duration_us: Some(ticks_to_us(parts.duration as i64, parts.timescale)),
        max_input_size: if largest > 0 { largest } else { DEFAULT_MAX_INPUT_SIZE },
        extra_data: entry.config,
        ..FormatDescriptor::new(mime)
    };

    Ok(Some(VideoTrack {
        track_id: parts.track_id,
        timescale: parts.timescale,
        format,
        samples,
    }))
}

fn parse_mdia(mut mdia: Bytes<'_>, parts: &mut Trak) -> Result<()> {
    while let Some((fourcc, mut body)) = mdia.next_box()? {
        match &fourcc {
            b"mdhd" => {
                let version = body.full_header()?;
                if version == 1 {
                    body.skip(16)?;
                    parts.timescale = body.u32()?;
                    parts.duration = body.u64()?;
                } else {
                    body.skip(8)?;
                    parts.timescale = body.u32()?;
                    parts.duration = body.u32()? as u64;
                }
            }
            b"hdlr" => {
                body.full_header()?;
                body.skip(4)?;
                parts.handler = body.fourcc()?;
            }
            b"minf" => {
                let mut minf = body;
                while let Some((fourcc, stbl)) = minf.next_box()? {
                    if &fourcc == b"stbl" {
                        parse_stbl(stbl, &mut parts.tables)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_stbl(mut stbl: Bytes<'_>, tables: &mut SampleTables) -> Result<()> {
    while let Some((fourcc, mut body)) = stbl.next_box()? {
        match &fourcc {
            b"stsd" => {
                body.full_header()?;
                let count = body.u32()?;
                if count > 0 {
                    if let Some((fourcc, entry)) = body.next_box()? {
                        tables.entry = Some(parse_visual_entry(fourcc, entry)?);
                    }
                }
            }
            b"stts" => {
                body.full_header()?;
                let count = body.counted(8)?;
                for _ in 0..count {
                    tables.time_to_sample.push((body.u32()?, body.u32()?));
                }
            }
            b"ctts" => {
                let version = body.full_header()?;
                let count = body.counted(8)?;
                for _ in 0..count {
                    let samples = body.u32()?;
                    let raw = body.u32()?;
                    let offset = if version == 1 { raw as i32 as i64 } else { raw as i64 };
                    tables.composition_offsets.push((samples, offset));
                }
            }
            b"stsc" => {
                body.full_header()?;
                let count = body.counted(12)?;
                for _ in 0..count {
                    let first_chunk = body.u32()?;
                    let per_chunk = body.u32()?;
                    body.skip(4)?;
                    tables.sample_to_chunk.push((first_chunk, per_chunk));
                }
            }
            b"stsz" => {
                body.full_header()?;
                let uniform = body.u32()?;
                let count = body.u32()? as usize;
                ensure!(count <= MAX_SAMPLES, "{count} samples is more than supported");
                tables.sizes = if uniform != 0 {
                    vec![uniform; count]
                } else {
                    ensure!(count * 4 <= body.remaining(), "stsz is truncated");
                    (0..count).map(|_| body.u32()).collect::<Result<_>>()?
                };
            }
            b"stco" => {
                body.full_header()?;
                let count = body.counted(4)?;
                for _ in 0..count {
                    tables.chunk_offsets.push(body.u32()? as u64);
                }
            }
            b"co64" => {
                body.full_header()?;
                let count = body.counted(8)?;
                for _ in 0..count {
                    tables.chunk_offsets.push(body.u64()?);
                }
            }
            b"stss" => {
                body.full_header()?;
                let count = body.counted(4)?;
                let sync = (0..count).map(|_| body.u32()).collect::<Result<_>>()?;
                tables.sync_samples = Some(sync);
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_visual_entry(fourcc: FourCc, mut entry: Bytes<'_>) -> Result<VisualEntry> {
    // SampleEntry (8) + pre_defined/reserved (16), then width and height.
    entry.skip(24)?;
    let width = entry.u16()?;
    let height = entry.u16()?;
    // Resolutions, frame count, compressor name, depth.
    entry.skip(50)?;

    let mut config = None;
    while let Some((child, body)) = entry.next_box()? {
        if matches!(&child, b"avcC" | b"hvcC" | b"vpcC" | b"av1C") {
            config = Some(body.rest().into());
        }
    }

    Ok(VisualEntry {
        fourcc,
        width,
        height,
        config,
    })
}

/// Expand chunk, size, timing and sync tables into per-sample entries.
fn flatten(tables: &SampleTables) -> Result<Vec<Mp4Sample>> {
    let sizes = &tables.sizes;
    let mut positions = Vec::with_capacity(sizes.len());

    'chunks: for (i, &(first_chunk, per_chunk)) in tables.sample_to_chunk.iter().enumerate() {
        let end_chunk = tables
            .sample_to_chunk
            .get(i + 1)
            .map_or(tables.chunk_offsets.len() as u32 + 1, |next| next.0);
        ensure!(
            first_chunk >= 1 && end_chunk >= first_chunk,
            "sample-to-chunk entries out of order"
        );

        for chunk in first_chunk..end_chunk {
            let Some(&base) = tables.chunk_offsets.get(chunk as usize - 1) else {
                bail!("sample-to-chunk references missing chunk {chunk}");
            };
            let mut offset = base;
            for _ in 0..per_chunk {
                let Some(&size) = sizes.get(positions.len()) else {
                    break 'chunks;
                };
                positions.push((offset, size));
                offset += size as u64;
            }
        }
    }
    ensure!(
        positions.len() == sizes.len(),
        "chunks cover {} of {} samples",
        positions.len(),
        sizes.len()
    );

    let mut deltas = expand(&tables.time_to_sample);
    let mut offsets = expand(&tables.composition_offsets);
    let mut dts: i64 = 0;

    let samples = positions
        .into_iter()
        .enumerate()
        .map(|(i, (offset, size))| {
            let pts = dts + offsets.next().unwrap_or(0);
            dts += deltas.next().unwrap_or(0) as i64;
            let number = i as u32 + 1;
            let sync = tables
                .sync_samples
                .as_ref()
                .is_none_or(|sync| sync.binary_search(&number).is_ok());
            Mp4Sample {
                offset,
                size,
                pts,
                sync,
            }
        })
        .collect();
    Ok(samples)
}

/// Run-length `(count, value)` pairs as one value per sample.
fn expand<T: Copy>(runs: &[(u32, T)]) -> impl Iterator<Item = T> + '_ {
    runs.iter()
        .flat_map(|&(count, value)| std::iter::repeat_n(value, count as usize))
}

fn video_mime(fourcc: FourCc) -> Option<&'static str> {
    let mime = match &fourcc {
        b"avc1" | b"avc3" => "video/avc",
        b"hvc1" | b"hev1" => "video/hevc",
        b"vp08" => "video/x-vnd.on2.vp8",
        b"vp09" => "video/x-vnd.on2.vp9",
        b"av01" => "video/av01",
        b"mp4v" => "video/mp4v-es",
        b"s263" => "video/3gpp",
        _ => return None,
    };
    Some(mime)
}

/// Convert track timescale ticks to microseconds.
pub(crate) fn ticks_to_us(ticks: i64, timescale: u32) -> i64 {
    if timescale == 0 {
        return ticks;
    }
    (ticks as i128 * 1_000_000 / timescale as i128) as i64
}

fn fourcc_str(fourcc: FourCc) -> String {
    String::from_utf8_lossy(&fourcc).into_owned()
}

/// Big-endian cursor over a box body.
struct Bytes<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Bytes<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(n <= self.remaining(), "box is truncated");
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(self) -> &'a [u8] {
        let buf = self.buf;
        &buf[self.pos..]
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(((self.u32()? as u64) << 32) | self.u32()? as u64)
    }

    fn fourcc(&mut self) -> Result<FourCc> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// Read a full box's version and flags, returning the version.
    fn full_header(&mut self) -> Result<u8> {
        let b = self.take(4)?;
        Ok(b[0])
    }

    /// Read an entry count and check that many `entry_len`-byte entries follow.
    fn counted(&mut self, entry_len: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        ensure!(
            count <= self.remaining() / entry_len,
            "table of {count} entries does not fit its box"
        );
        Ok(count)
    }

    fn next_box(&mut self) -> Result<Option<(FourCc, Bytes<'a>)>> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        // Trailing padding shorter than a header.
        if self.remaining() < 8 {
            self.pos = self.buf.len();
            return Ok(None);
        }

        let size = self.u32()? as u64;
        let fourcc = self.fourcc()?;
        let body_len = match size {
            0 => self.remaining() as u64,
            1 => self
                .u64()?
                .checked_sub(16)
                .context("box size smaller than its header")?,
            n => n.checked_sub(8).context("box size smaller than its header")?,
        };
        ensure!(
            body_len <= self.remaining() as u64,
            "box '{}' overruns its parent",
            fourcc_str(fourcc)
        );

        let body = self.take(body_len as usize)?;
        Ok(Some((fourcc, Bytes::new(body))))
    }
}
