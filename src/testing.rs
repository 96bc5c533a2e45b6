//! Scripted collaborators for unit tests: a fake codec family, a vector-backed sample source,
//! recording sinks, and a builder for small MP4 files.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::{
    Codec, CodecError, CodecErrorKind, CodecEvent, CodecInfo, CodecRegistry, DecodedFrame,
    DownstreamEncoder, EventCallback, FrameSink, SharedFrameSink,
};
use crate::demux::SampleSource;
use crate::format::FormatDescriptor;
use crate::sample::{BufferFlags, BufferInfo, SampleInfo};
use crate::{Error, Result};

/// Behavior of one fake codec implementation.
#[derive(Debug, Clone)]
pub(crate) struct FakeSpec {
    pub name: String,
    pub mime: String,
    pub is_encoder: bool,
    pub reject_format: bool,
    pub fail_create: bool,
    pub fail_configure: bool,
    pub fail_start: bool,
    pub config_output: bool,
    pub output_format: Option<String>,
    pub inputs: usize,
    pub capacity: usize,
    /// Emit the error instead of an output when the n-th input (1-based) is queued.
    pub errors_at: Vec<(usize, CodecError)>,
    /// Emit this error for every queued media input.
    pub error_always: Option<CodecError>,
    /// Payload size of the output that carries end-of-stream.
    pub end_of_stream_payload: usize,
    pub create_delay: Option<Duration>,
}

impl FakeSpec {
    pub fn decoder(name: &str, mime: &str) -> Self {
        Self {
            name: name.to_string(),
            mime: mime.to_string(),
            is_encoder: false,
            reject_format: false,
            fail_create: false,
            fail_configure: false,
            fail_start: false,
            config_output: false,
            output_format: None,
            inputs: 2,
            capacity: 64,
            errors_at: Vec::new(),
            error_always: None,
            end_of_stream_payload: 0,
            create_delay: None,
        }
    }

    pub fn as_encoder(mut self) -> Self {
        self.is_encoder = true;
        self
    }

    pub fn rejecting_format(mut self) -> Self {
        self.reject_format = true;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn with_config_output(mut self) -> Self {
        self.config_output = true;
        self
    }

    pub fn announcing_output_format(mut self, mime: &str) -> Self {
        self.output_format = Some(mime.to_string());
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn error_at(mut self, nth_input: usize, err: CodecError) -> Self {
        self.errors_at.push((nth_input, err));
        self
    }

    pub fn error_always(mut self, err: CodecError) -> Self {
        self.error_always = Some(err);
        self
    }

    pub fn with_end_of_stream_payload(mut self, size: usize) -> Self {
        self.end_of_stream_payload = size;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }
}

/// Lifecycle counters shared by every codec a `FakeRegistry` creates.
#[derive(Default)]
pub(crate) struct FakeStats {
    pub created: AtomicUsize,
    pub configured: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub released: AtomicUsize,
    pub queued: Mutex<Vec<BufferInfo>>,
    /// Render flag of every released output buffer, in order.
    pub output_releases: Mutex<Vec<bool>>,
}

impl FakeStats {
    pub fn live(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> Vec<BufferInfo> {
        self.queued.lock().unwrap().clone()
    }

    pub fn output_releases(&self) -> Vec<bool> {
        self.output_releases.lock().unwrap().clone()
    }
}

pub(crate) struct FakeRegistry {
    specs: Vec<FakeSpec>,
    pub stats: Arc<FakeStats>,
}

impl FakeRegistry {
    pub fn new(specs: Vec<FakeSpec>) -> Self {
        Self {
            specs,
            stats: Arc::new(FakeStats::default()),
        }
    }
}

impl CodecRegistry for FakeRegistry {
    fn codec_infos(&self) -> Vec<CodecInfo> {
        self.specs
            .iter()
            .map(|s| CodecInfo {
                name: s.name.clone(),
                is_encoder: s.is_encoder,
                supported_types: vec![s.mime.clone()],
            })
            .collect()
    }

    fn is_format_supported(
        &self,
        info: &CodecInfo,
        format: &FormatDescriptor,
    ) -> std::result::Result<bool, CodecError> {
        if !info.supports_type(&format.mime) {
            return Err(CodecError::fatal(
                CodecErrorKind::Unsupported,
                format!("{} does not handle {}", info.name, format.mime),
            ));
        }
        let spec = self.spec(&info.name)?;
        Ok(!spec.reject_format)
    }

    fn create_by_name(&self, name: &str) -> std::result::Result<Box<dyn Codec>, CodecError> {
        let spec = self.spec(name)?;
        if let Some(delay) = spec.create_delay {
            std::thread::sleep(delay);
        }
        if spec.fail_create {
            return Err(CodecError::fatal(
                CodecErrorKind::Internal,
                format!("cannot instantiate {name}"),
            ));
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCodec::new(spec.clone(), self.stats.clone())))
    }
}

impl FakeRegistry {
    fn spec(&self, name: &str) -> std::result::Result<&FakeSpec, CodecError> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CodecError::fatal(CodecErrorKind::Internal, format!("no codec {name}")))
    }
}

/// A codec that turns every queued input into one output of the same size.
pub(crate) struct FakeCodec {
    spec: FakeSpec,
    stats: Arc<FakeStats>,
    callback: Option<EventCallback>,
    surface: Option<SharedFrameSink>,
    configured: bool,
    running: bool,
    released: bool,
    inputs: Vec<Vec<u8>>,
    owned: Vec<bool>,
    outputs: HashMap<usize, BufferInfo>,
    next_output: usize,
    queued: usize,
}

impl FakeCodec {
    fn new(spec: FakeSpec, stats: Arc<FakeStats>) -> Self {
        Self {
            spec,
            stats,
            callback: None,
            surface: None,
            configured: false,
            running: false,
            released: false,
            inputs: Vec::new(),
            owned: Vec::new(),
            outputs: HashMap::new(),
            next_output: 0,
            queued: 0,
        }
    }

    fn emit(&self, event: CodecEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }

    fn push_output(&mut self, info: BufferInfo) {
        let index = self.next_output;
        self.next_output += 1;
        self.outputs.insert(index, info);
        self.emit(CodecEvent::OutputAvailable { index, info });
    }

    fn give_back_input(&mut self, index: usize) {
        self.owned[index] = true;
        self.emit(CodecEvent::InputAvailable(index));
    }
}

impl Codec for FakeCodec {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn set_callback(&mut self, callback: EventCallback) {
        self.callback = Some(callback);
    }

    fn configure(
        &mut self,
        _format: &FormatDescriptor,
        surface: Option<SharedFrameSink>,
    ) -> std::result::Result<(), CodecError> {
        if self.released || self.running {
            return Err(CodecError::invalid_state("configure in wrong state"));
        }
        if self.spec.fail_configure {
            return Err(CodecError::fatal(
                CodecErrorKind::Unsupported,
                "surface rejected",
            ));
        }
        self.surface = surface;
        self.inputs = vec![vec![0; self.spec.capacity]; self.spec.inputs];
        self.owned = vec![false; self.spec.inputs];
        self.configured = true;
        self.stats.configured.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start(&mut self) -> std::result::Result<(), CodecError> {
        if !self.configured {
            return Err(CodecError::invalid_state("start before configure"));
        }
        if self.spec.fail_start {
            return Err(CodecError::fatal(CodecErrorKind::Internal, "start failed"));
        }
        self.running = true;
        self.stats.started.fetch_add(1, Ordering::SeqCst);

        if self.spec.config_output {
            self.push_output(BufferInfo::new(8, 0, BufferFlags::CODEC_CONFIG));
        }
        if let Some(mime) = self.spec.output_format.clone() {
            self.emit(CodecEvent::FormatChanged(FormatDescriptor::new(mime)));
        }
        for index in 0..self.spec.inputs {
            self.give_back_input(index);
        }
        Ok(())
    }

    fn stop(&mut self) -> std::result::Result<(), CodecError> {
        self.running = false;
        self.configured = false;
        self.outputs.clear();
        self.owned.iter_mut().for_each(|o| *o = false);
        self.stats.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.running = false;
            self.stats.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]> {
        if !self.running || !self.owned.get(index).copied().unwrap_or(false) {
            return None;
        }
        Some(&mut self.inputs[index][..])
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        info: BufferInfo,
    ) -> std::result::Result<(), CodecError> {
        if !self.running || !self.owned.get(index).copied().unwrap_or(false) {
            return Err(CodecError::invalid_state(format!(
                "input buffer {index} is not owned by the client"
            )));
        }
        self.owned[index] = false;
        self.stats.queued.lock().unwrap().push(info);

        if info.is_end_of_stream() {
            let size = self.spec.end_of_stream_payload;
            self.push_output(BufferInfo::new(size, info.presentation_time_us, info.flags));
            return Ok(());
        }

        self.queued += 1;
        let scripted = self
            .spec
            .errors_at
            .iter()
            .find(|(at, _)| *at == self.queued)
            .map(|(_, err)| err.clone())
            .or_else(|| self.spec.error_always.clone());

        match scripted {
            Some(err) => self.emit(CodecEvent::Error(err)),
            None => self.push_output(BufferInfo::new(
                info.size,
                info.presentation_time_us,
                BufferFlags::NONE,
            )),
        }
        self.give_back_input(index);
        Ok(())
    }

    fn release_output_buffer(
        &mut self,
        index: usize,
        render: bool,
    ) -> std::result::Result<(), CodecError> {
        let info = self
            .outputs
            .remove(&index)
            .ok_or_else(|| CodecError::invalid_state(format!("unknown output buffer {index}")))?;
        self.stats.output_releases.lock().unwrap().push(render);
        if !render {
            return Ok(());
        }
        if let Some(surface) = &self.surface {
            surface.on_frame(&DecodedFrame {
                presentation_time_us: info.presentation_time_us,
                sample_rate: 0,
                channels: 0,
                samples: vec![0.0; info.size],
            });
        }
        Ok(())
    }
}

/// A sample source over in-memory payloads; timestamps are 1ms apart.
pub(crate) struct VecSource {
    samples: Vec<Vec<u8>>,
    cursor: usize,
    pub releases: Arc<AtomicUsize>,
}

impl VecSource {
    pub fn new(samples: Vec<Vec<u8>>) -> Self {
        Self {
            samples,
            cursor: 0,
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `count` samples of `size` bytes each.
    pub fn uniform(count: usize, size: usize) -> Self {
        Self::new((0..count).map(|i| vec![i as u8; size]).collect())
    }
}

impl SampleSource for VecSource {
    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<SampleInfo>> {
        let Some(data) = self.samples.get(self.cursor) else {
            return Ok(None);
        };
        if data.len() > buf.len() {
            return Err(Error::BufferTooSmall {
                needed: data.len(),
                capacity: buf.len(),
            });
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(Some(SampleInfo {
            size: data.len(),
            presentation_time_us: self.cursor as i64 * 1000,
            flags: BufferFlags::KEY_FRAME,
        }))
    }

    fn advance(&mut self) -> Result<bool> {
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
pub(crate) struct RecordingSink {
    pub frames: Mutex<Vec<DecodedFrame>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl FrameSink for RecordingSink {
    fn on_frame(&self, frame: &DecodedFrame) {
        self.frames.lock().unwrap().push(frame.clone());
    }
}

#[derive(Default)]
pub(crate) struct CountingEncoder {
    pub signals: AtomicUsize,
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

/// Collects codec events the way the pump's worker queue would.
#[derive(Clone, Default)]
pub(crate) struct EventQueue {
    events: Arc<Mutex<VecDeque<(u64, CodecEvent)>>>,
}

impl EventQueue {
    pub fn poster(&self) -> Arc<dyn Fn(u64, CodecEvent) + Send + Sync> {
        let events = self.events.clone();
        Arc::new(move |generation, event| {
            events.lock().unwrap().push_back((generation, event));
        })
    }

    pub fn pop(&self) -> Option<(u64, CodecEvent)> {
        self.events.lock().unwrap().pop_front()
    }
}

/// Writes a single-track AVC file with every sample in one chunk.
pub(crate) struct Mp4Builder {
    width: u16,
    height: u16,
    timescale: u32,
    samples: Vec<(Vec<u8>, u32, bool)>,
}

impl Mp4Builder {
    pub fn avc(width: u16, height: u16, timescale: u32) -> Self {
        Self {
            width,
            height,
            timescale,
            samples: Vec::new(),
        }
    }

    pub fn sample(mut self, data: &[u8], duration: u32, sync: bool) -> Self {
        self.samples.push((data.to_vec(), duration, sync));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let ftyp = mp4_box(b"ftyp", &[&b"isom"[..], &[0; 4], b"isomavc1"].concat());
        // The chunk offset is fixed width, so the moov size does not depend on it.
        let mdat_start = ftyp.len() + self.moov(0).len() + 8;
        let moov = self.moov(mdat_start as u32);
        let payload: Vec<u8> = self.samples.iter().flat_map(|s| s.0.clone()).collect();
        [ftyp, moov, mp4_box(b"mdat", &payload)].concat()
    }

    fn moov(&self, chunk_offset: u32) -> Vec<u8> {
        let count = self.samples.len() as u32;
        let duration: u32 = self.samples.iter().map(|s| s.1).sum();
        let be = |v: u32| v.to_be_bytes();

        let mvhd = full_box(
            b"mvhd",
            &[&[0; 8][..], &be(self.timescale), &be(duration), &[0; 76], &be(2)].concat(),
        );
        let tkhd = full_box(
            b"tkhd",
            &[
                &[0; 8][..],
                &be(1),
                &[0; 4],
                &be(duration),
                &[0; 52],
                &be((self.width as u32) << 16),
                &be((self.height as u32) << 16),
            ]
            .concat(),
        );
        let mdhd = full_box(
            b"mdhd",
            &[&[0; 8][..], &be(self.timescale), &be(duration), &[0x55, 0xC4, 0, 0]].concat(),
        );
        let hdlr = full_box(b"hdlr", &[&[0; 4][..], b"vide", &[0; 12], b"Video\0"].concat());

        let avcc = mp4_box(b"avcC", &[1, 0x42, 0xC0, 0x1E, 0xFF, 0xE0, 0x00]);
        let avc1 = mp4_box(
            b"avc1",
            &[
                &[0, 0, 0, 0, 0, 0, 0, 1][..],
                &[0; 16],
                &self.width.to_be_bytes(),
                &self.height.to_be_bytes(),
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
        let mut stss = Vec::new();
        for (i, (data, delta, sync)) in self.samples.iter().enumerate() {
            stts.extend([be(1), be(*delta)].concat());
            stsz.extend(be(data.len() as u32));
            if *sync {
                stss.extend(be(i as u32 + 1));
            }
        }
        let stss = [&be(stss.len() as u32 / 4)[..], &stss[..]].concat();

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
