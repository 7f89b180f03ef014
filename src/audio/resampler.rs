//! Downmix and sample-rate conversion
//!
//! Turns arbitrary-rate, multi-channel int16 frames into mono little-endian
//! PCM at the ASR target rate. Rate conversion is linear interpolation with
//! the read position and last sample carried across frames, so frame
//! boundaries do not click and cumulative output counts stay within one
//! sample of `n_in * target / source`.

use super::AudioFrame;
use crate::error::SttError;

/// Stateful mono resampler
///
/// One instance per session; feed frames in arrival order.
pub struct Resampler {
    target_rate: u32,
    /// Last mono input sample of the previous frame, index 0 of the next window
    carry: Option<i16>,
    /// Fractional read position, measured from the carry sample
    pos: f64,
}

impl Resampler {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            carry: None,
            pos: 0.0,
        }
    }

    /// Convert one frame to mono int16 little-endian bytes at the target rate
    ///
    /// Returns an empty buffer when the frame is too short to produce a
    /// sample at the current read position; the remainder carries over.
    pub fn process(&mut self, frame: &AudioFrame) -> Result<Vec<u8>, SttError> {
        frame.validate()?;
        if frame.data.is_empty() {
            return Ok(Vec::new());
        }

        let mono = downmix(&frame.data, frame.channels as usize);

        if frame.sample_rate == self.target_rate {
            // Pass-through; still remember the tail for continuity
            self.carry = mono.last().copied();
            return Ok(to_le_bytes(&mono));
        }

        let step = frame.sample_rate as f64 / self.target_rate as f64;
        let window: Vec<i16> = match self.carry {
            Some(prev) => std::iter::once(prev).chain(mono).collect(),
            None => mono,
        };

        if window.len() < 2 {
            self.carry = window.last().copied();
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(2 * (window.len() as f64 / step) as usize + 4);
        let mut pos = self.pos;
        while (pos.floor() as usize) + 1 < window.len() {
            let i = pos.floor() as usize;
            let frac = pos - i as f64;
            let s0 = window[i] as f64;
            let s1 = window[i + 1] as f64;
            let sample = (s0 + (s1 - s0) * frac).round() as i16;
            out.extend_from_slice(&sample.to_le_bytes());
            pos += step;
        }

        // Rebase so the last input sample becomes index 0 of the next window
        self.pos = pos - (window.len() - 1) as f64;
        self.carry = window.last().copied();
        Ok(out)
    }
}

/// Average interleaved channels into mono, truncating toward zero
fn downmix(data: &[i16], channels: usize) -> Vec<i16> {
    if channels == 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|group| {
            let sum: i32 = group.iter().map(|&s| s as i32).sum();
            ((sum / channels as i32).clamp(i16::MIN as i32, i16::MAX as i32)) as i16
        })
        .collect()
}

fn to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
