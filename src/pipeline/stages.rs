//! Transform stages between the per-request source and the sink.

/// Interprets a raw S16LE byte stream as mono samples.
///
/// Chunk boundaries are arbitrary, so a dangling odd byte is carried over to
/// the next chunk.
#[derive(Debug)]
pub struct RawAudioParse {
    channels: u16,
    sample_rate: u32,
    carry: Option<u8>,
}

impl RawAudioParse {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
            carry: None,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity((bytes.len() + 1) / 2);
        let mut rest = bytes;

        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    samples.push(i16::from_le_bytes([low, high]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }

        let mut pairs = rest.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
        self.carry = pairs.remainder().first().copied();
        samples
    }
}

/// Sample format conversion between the integer wire format and float processing.
pub struct AudioConvert;

impl AudioConvert {
    pub fn to_f32(samples: &[i16]) -> Vec<f32> {
        samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }

    pub fn to_s16le(samples: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            let v = (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// Window of the delay-line pitch shifter, in samples.
const PITCH_WINDOW: usize = 1024;

/// Streaming pitch shifter that keeps duration intact.
///
/// Two read taps sweep a delay line half a window apart and are crossfaded with
/// complementary Hann weights. Ratio 1.0 passes samples through untouched.
#[derive(Debug)]
pub struct PitchShift {
    ratio: f32,
    history: Vec<f32>,
    write: usize,
    phase: f32,
}

impl PitchShift {
    pub fn new(ratio: f32) -> Self {
        let mut shifter = Self {
            ratio: 1.0,
            history: vec![0.0; PITCH_WINDOW * 2],
            write: 0,
            phase: 0.0,
        };
        shifter.set_ratio(ratio);
        shifter
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    /// Non-positive or non-finite ratios fall back to identity.
    pub fn set_ratio(&mut self, ratio: f32) {
        self.ratio = if ratio.is_finite() && ratio > 0.0 {
            ratio
        } else {
            1.0
        };
    }

    pub fn is_identity(&self) -> bool {
        (self.ratio - 1.0).abs() < 1e-4
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_identity() {
            return input.to_vec();
        }

        let window = PITCH_WINDOW as f32;
        let len = self.history.len();
        let mut out = Vec::with_capacity(input.len());

        for &sample in input {
            self.history[self.write] = sample;

            let mut acc = 0.0;
            for tap in 0..2 {
                let delay = (self.phase + tap as f32 * window / 2.0) % window;
                let gain = (std::f32::consts::PI * delay / window).sin().powi(2);
                acc += gain * self.read_delayed(delay, len);
            }
            out.push(acc);

            self.phase = (self.phase + 1.0 - self.ratio).rem_euclid(window);
            self.write = (self.write + 1) % len;
        }

        out
    }

    fn read_delayed(&self, delay: f32, len: usize) -> f32 {
        let pos = self.write as f32 - delay;
        let pos = pos.rem_euclid(len as f32);
        let i0 = pos.floor() as usize % len;
        let i1 = (i0 + 1) % len;
        let frac = pos - pos.floor();
        self.history[i0] * (1.0 - frac) + self.history[i1] * frac
    }
}
