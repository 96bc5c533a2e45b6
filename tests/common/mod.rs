//! Collaborators shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use compressor::{
    BufferFlags, BufferInfo, Codec, CodecError, CodecErrorKind, CodecEvent, CodecInfo,
    CodecRegistry, DecodedFrame, DownstreamEncoder, EventCallback, FormatDescriptor, FrameSink,
    SampleInfo, SampleSource, SharedFrameSink,
};

/// Write a 16-bit PCM WAV of `frames` frames into `dir` and return its path.
pub fn write_wav(
    dir: &Path,
    name: &str,
    channels: u16,
    sample_rate: u32,
    frames: usize,
) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
    for i in 0..frames {
        for ch in 0..channels {
            let value = ((i * 37 + ch as usize * 11) % 2000) as i16 - 1000;
            writer.write_sample(value).expect("write sample");
        }
    }
    writer.finalize().expect("finalize wav");
    path
}

/// One sample of a generated video track: payload, duration in timescale units, sync flag.
pub type VideoSample<'a> = (&'a [u8], u32, bool);

/// Write a single-track 320x240 AVC file at a 90kHz timescale, all samples in one chunk.
pub fn write_avc_mp4(dir: &Path, name: &str, samples: &[VideoSample<'_>]) -> PathBuf {
    let ftyp = mp4_box(b"ftyp", &[&b"isom"[..], &[0; 4], b"isomavc1"].concat());
    let mdat_start = ftyp.len() + avc_moov(samples, 0).len() + 8;
    let moov = avc_moov(samples, mdat_start as u32);
    let payload: Vec<u8> = samples.iter().flat_map(|s| s.0.iter().copied()).collect();

    let path = dir.join(name);
    std::fs::write(&path, [ftyp, moov, mp4_box(b"mdat", &payload)].concat()).expect("write mp4");
    path
}

fn avc_moov(samples: &[VideoSample<'_>], chunk_offset: u32) -> Vec<u8> {
    const TIMESCALE: u32 = 90_000;
    let be = |v: u32| v.to_be_bytes();
    let count = samples.len() as u32;
    let duration: u32 = samples.iter().map(|s| s.1).sum();

    let mvhd = full_box(
        b"mvhd",
        &[&[0; 8][..], &be(TIMESCALE), &be(duration), &[0; 76], &be(2)].concat(),
    );
    let tkhd = full_box(
        b"tkhd",
        &[&[0; 8][..], &be(1), &[0; 4], &be(duration), &[0; 52], &be(320 << 16), &be(240 << 16)]
            .concat(),
    );
    let mdhd = full_box(
        b"mdhd",
        &[&[0; 8][..], &be(TIMESCALE), &be(duration), &[0x55, 0xC4, 0, 0]].concat(),
    );
    let hdlr = full_box(b"hdlr", &[&[0; 4][..], b"vide", &[0; 12], b"Video\0"].concat());

    let avcc = mp4_box(b"avcC", &[1, 0x42, 0xC0, 0x1E, 0xFF, 0xE0, 0x00]);
    let avc1 = mp4_box(
        b"avc1",
        &[
            &[0, 0, 0, 0, 0, 0, 0, 1][..],
            &[0; 16],
            &320u16.to_be_bytes(),
            &240u16.to_be_bytes(),
            &be(0x0048_0000),
            &be(0x0048_0000),
            &[0; 4],
            &1u16.to_be_bytes(),
            &[0; 32],
            &[0x00, 0x18, 0xFF, 0xFF],
            &avcc[..],
        ]
        .concat(),
    );
    let stsd = full_box(b"stsd", &[&be(1)[..], &avc1[..]].concat());

    let mut stts = be(count).to_vec();
    let mut stsz = [be(0), be(count)].concat();
    let mut sync = Vec::new();
    for (i, (data, delta, is_sync)) in samples.iter().enumerate() {
        stts.extend([be(1), be(*delta)].concat());
        stsz.extend(be(data.len() as u32));
        if *is_sync {
            sync.push(i as u32 + 1);
        }
    }
    let mut stss = be(sync.len() as u32).to_vec();
    stss.extend(sync.into_iter().flat_map(be));

    let stbl = mp4_box(
        b"stbl",
        &[
            stsd,
            full_box(b"stts", &stts),
            full_box(b"stsc", &[be(1), be(1), be(count), be(1)].concat()),
            full_box(b"stsz", &stsz),
            full_box(b"stco", &[be(1), be(chunk_offset)].concat()),
            full_box(b"stss", &stss),
        ]
        .concat(),
    );
    let vmhd = mp4_box(b"vmhd", &[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
    let minf = mp4_box(b"minf", &[vmhd, stbl].concat());
    let mdia = mp4_box(b"mdia", &[mdhd, hdlr, minf].concat());
    let trak = mp4_box(b"trak", &[tkhd, mdia].concat());
    mp4_box(b"moov", &[mvhd, trak].concat())
}

fn mp4_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

fn full_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    mp4_box(fourcc, &[&[0u8; 4][..], body].concat())
}

/// In-memory samples, 1ms apart.
pub struct VecSource {
    samples: Vec<Vec<u8>>,
    cursor: usize,
    pub releases: Arc<AtomicUsize>,
}

impl VecSource {
    pub fn uniform(count: usize, size: usize) -> Self {
        Self {
            samples: (0..count).map(|i| vec![i as u8; size]).collect(),
            cursor: 0,
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SampleSource for VecSource {
    fn read_sample(&mut self, buf: &mut [u8]) -> compressor::Result<Option<SampleInfo>> {
        let Some(data) = self.samples.get(self.cursor) else {
            return Ok(None);
        };
        buf[..data.len()].copy_from_slice(data);
        Ok(Some(SampleInfo {
            size: data.len(),
            presentation_time_us: self.cursor as i64 * 1000,
            flags: BufferFlags::KEY_FRAME,
        }))
    }

    fn advance(&mut self) -> compressor::Result<bool> {
        if self.cursor < self.samples.len() {
            self.cursor += 1;
        }
        Ok(self.cursor < self.samples.len())
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<DecodedFrame>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn total_samples(&self) -> usize {
        self.frames.lock().unwrap().iter().map(|f| f.samples.len()).sum()
    }
}

impl FrameSink for RecordingSink {
    fn on_frame(&self, frame: &DecodedFrame) {
        self.frames.lock().unwrap().push(frame.clone());
    }
}

#[derive(Default)]
pub struct CountingEncoder {
    signals: AtomicUsize,
}

impl CountingEncoder {
    pub fn count(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }
}

impl DownstreamEncoder for CountingEncoder {
    fn signal_end_of_input_stream(&self) {
        self.signals.fetch_add(1, Ordering::SeqCst);
    }
}

/// A registry with a single pass-through decoder.
pub struct LoopbackRegistry {
    mime: String,
    inputs: usize,
    create_delay: Option<Duration>,
    pub created: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl LoopbackRegistry {
    pub fn new(mime: &str) -> Self {
        Self {
            mime: mime.to_string(),
            inputs: 2,
            create_delay: None,
            created: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of input buffers announced on start. Zero keeps the session idle.
    pub fn with_inputs(mut self, inputs: usize) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn live(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

impl CodecRegistry for LoopbackRegistry {
    fn codec_infos(&self) -> Vec<CodecInfo> {
        vec![CodecInfo::decoder("loopback", &[self.mime.as_str()])]
    }

    fn is_format_supported(
        &self,
        info: &CodecInfo,
        format: &FormatDescriptor,
    ) -> Result<bool, CodecError> {
        Ok(info.supports_type(&format.mime))
    }

    fn create_by_name(&self, _name: &str) -> Result<Box<dyn Codec>, CodecError> {
        if let Some(delay) = self.create_delay {
            std::thread::sleep(delay);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackCodec {
            inputs: self.inputs,
            released: self.released.clone(),
            callback: None,
            surface: None,
            buffers: Vec::new(),
            pending: Vec::new(),
            is_released: false,
        }))
    }
}

struct LoopbackCodec {
    inputs: usize,
    released: Arc<AtomicUsize>,
    callback: Option<EventCallback>,
    surface: Option<SharedFrameSink>,
    buffers: Vec<Vec<u8>>,
    pending: Vec<Option<BufferInfo>>,
    is_released: bool,
}

impl LoopbackCodec {
    fn emit(&self, event: CodecEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }
}

impl Codec for LoopbackCodec {
    fn name(&self) -> &str {
        "loopback"
    }

    fn set_callback(&mut self, callback: EventCallback) {
        self.callback = Some(callback);
    }

    fn configure(
        &mut self,
        format: &FormatDescriptor,
        surface: Option<SharedFrameSink>,
    ) -> Result<(), CodecError> {
        self.surface = surface;
        self.buffers = vec![vec![0; format.max_input_size.min(4096)]; self.inputs];
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        for index in 0..self.inputs {
            self.emit(CodecEvent::InputAvailable(index));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.pending.clear();
        Ok(())
    }

    fn release(&mut self) {
        if !self.is_released {
            self.is_released = true;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]> {
        self.buffers.get_mut(index).map(|b| b.as_mut_slice())
    }

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> Result<(), CodecError> {
        if index >= self.buffers.len() {
            return Err(CodecError::invalid_state(format!("no input buffer {index}")));
        }
        let out = self.pending.len();
        self.pending.push(Some(info));
        self.emit(CodecEvent::OutputAvailable { index: out, info });
        if !info.is_end_of_stream() {
            self.emit(CodecEvent::InputAvailable(index));
        }
        Ok(())
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
        let info = self
            .pending
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| {
                CodecError::fatal(CodecErrorKind::InvalidState, format!("no output {index}"))
            })?;
        if render {
            if let Some(surface) = &self.surface {
                surface.on_frame(&DecodedFrame {
                    presentation_time_us: info.presentation_time_us,
                    samples: vec![0.0; info.size],
                    ..DecodedFrame::default()
                });
            }
        }
        Ok(())
    }
}
