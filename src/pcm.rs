//! PCM conversion for the software backend.
//!
//! Symphonia hands out planar buffers in the codec's native sample type. Frames leave the
//! backend as interleaved `f32`, which is what the output target receives.

use anyhow::{Result, bail};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer, SignalSpec};

/// Reusable scratch space for turning decoded buffers into interleaved `f32`.
#[derive(Default)]
pub(crate) struct Interleaver {
    // Scratch buffer used to copy decoded PCM into an interleaved `Vec<f32>`.
    sample_buf: Option<SampleBuffer<f32>>,
    // Spec and frame capacity `sample_buf` was allocated for.
    spec: Option<SignalSpec>,
    frames: u64,
}

impl Interleaver {
    /// Copy `decoded` into an owned interleaved buffer and report its signal spec.
    pub(crate) fn interleave(
        &mut self,
        decoded: &AudioBufferRef<'_>,
    ) -> Result<(Vec<f32>, SignalSpec)> {
        let spec = *decoded.spec();
        if spec.channels.count() == 0 {
            bail!("decoded audio had zero channels");
        }

        self.ensure_capacity(decoded);
        let Some(buf) = self.sample_buf.as_mut() else {
            bail!("sample buffer not initialized");
        };

        buf.copy_interleaved_ref(decoded.clone());
        Ok((buf.samples().to_vec(), spec))
    }

    fn ensure_capacity(&mut self, decoded: &AudioBufferRef<'_>) {
        let spec = *decoded.spec();
        let frames = decoded.capacity() as u64;

        // Reallocate when the layout changes or a larger packet shows up.
        if self.sample_buf.is_some() && self.spec == Some(spec) && self.frames >= frames {
            return;
        }

        self.sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
        self.spec = Some(spec);
        self.frames = frames;
    }
}
