use std::collections::VecDeque;

use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler};

use super::AudioProcessor;
use crate::messages::AudioFrame;
use anyhow::{anyhow, bail, Result};

pub const DECIMATION_FACTOR: usize = 2;
pub const FILTER_ORDER: usize = 63;
pub const FILTER_CUTOFF: f64 = 0.4;
pub const KAISER_BETA: f64 = 7.5;

const BESSEL_TERMS: u32 = 25;
const FFT_CHUNK_SIZE: usize = 1024;

/// Modified Bessel function of the first kind, order 0, by series expansion.
pub fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    for m in 1..BESSEL_TERMS {
        let m = m as f64;
        term *= (x * x) / (4.0 * m * m);
        sum += term;
    }
    sum
}

fn kaiser_window(n: usize, order: usize, beta: f64) -> f64 {
    let r = 2.0 * n as f64 / order as f64 - 1.0;
    let arg = beta * (1.0 - r * r).max(0.0).sqrt();
    bessel_i0(arg) / bessel_i0(beta)
}

/// Kaiser-windowed sinc lowpass with `order + 1` taps, normalized to unity DC gain.
pub fn design_kaiser_lowpass(order: usize, cutoff: f64, beta: f64) -> Vec<f64> {
    let center = order as f64 / 2.0;
    let mut coeffs: Vec<f64> = (0..=order)
        .map(|n| {
            let offset = n as f64 - center;
            if offset == 0.0 {
                2.0 * cutoff
            } else {
                let x = offset * std::f64::consts::PI;
                (2.0 * cutoff * x).sin() / x * kaiser_window(n, order, beta)
            }
        })
        .collect();

    let sum: f64 = coeffs.iter().sum();
    coeffs.iter_mut().for_each(|c| *c /= sum);
    coeffs
}

/// 2:1 anti-aliasing decimator.
///
/// Samples that precede the current call are read from a circular history of
/// the last `order` inputs, and the even/odd position of the stream is carried
/// over, so splitting a stream across calls (of any length) gives the same
/// output as one long call.
pub struct KaiserDecimator {
    coeffs: Vec<f64>,
    history: Vec<f32>,
    pos: usize,
    // Offset of the next kept sample into the following input: 0 or 1
    phase: usize,
}

impl KaiserDecimator {
    pub fn new() -> Self {
        Self::with_design(FILTER_ORDER, FILTER_CUTOFF, KAISER_BETA)
    }

    pub fn with_design(order: usize, cutoff: f64, beta: f64) -> Self {
        let order = order.max(1);
        let coeffs = design_kaiser_lowpass(order, cutoff, beta);
        tracing::debug!(
            "Kaiser FIR designed: order={}, cutoff={}, beta={}",
            order,
            cutoff,
            beta
        );
        Self {
            coeffs,
            history: vec![0.0; order],
            pos: 0,
            phase: 0,
        }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn order(&self) -> usize {
        self.history.len()
    }

    /// Filter and keep every second sample of the stream. Over any split of a
    /// stream of `n` samples the outputs add up to `n.div_ceil(2)`.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let m = self.history.len();
        let out_len = input.len().saturating_sub(self.phase).div_ceil(DECIMATION_FACTOR);
        let mut output = Vec::with_capacity(out_len);

        for i in 0..out_len {
            let n = self.phase + i * DECIMATION_FACTOR;
            let mut acc = 0.0_f64;
            for (k, &c) in self.coeffs.iter().enumerate() {
                let sample = if k <= n {
                    input[n - k]
                } else {
                    // k - n is in 1..=m here
                    self.history[(self.pos + m - (k - n)) % m]
                };
                acc += c * sample as f64;
            }
            output.push(acc as f32);
        }

        let keep = m.min(input.len());
        let tail = &input[input.len() - keep..];
        for (i, &s) in tail.iter().enumerate() {
            self.history[(self.pos + i) % m] = s;
        }
        self.pos = (self.pos + keep) % m;
        self.phase = (self.phase + out_len * DECIMATION_FACTOR) - input.len();

        output
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.pos = 0;
        self.phase = 0;
    }
}

impl Default for KaiserDecimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Decimates processed audio from the processing rate to the output rate.
pub struct DecimationProcessor {
    decimator: KaiserDecimator,
    input_rate: u32,
}

impl DecimationProcessor {
    pub fn new(input_rate: u32) -> Self {
        Self {
            decimator: KaiserDecimator::new(),
            input_rate,
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.input_rate / DECIMATION_FACTOR as u32
    }
}

impl AudioProcessor for DecimationProcessor {
    fn process(&mut self, frame: AudioFrame) -> Result<Option<AudioFrame>> {
        if frame.channels != 1 || frame.sample_rate != self.input_rate {
            bail!(
                "decimator expects mono {}Hz, got {}ch {}Hz",
                self.input_rate,
                frame.channels,
                frame.sample_rate
            );
        }
        let samples = self.decimator.process(&frame.samples);
        Ok(Some(AudioFrame::mono(samples, self.output_rate(), frame.timestamp)))
    }

    fn flush(&mut self) -> Vec<AudioFrame> {
        Vec::new()
    }

    fn reset(&mut self) {
        self.decimator.reset();
    }

    fn name(&self) -> &'static str {
        "decimator"
    }
}

// Custom adapter to bridge raw buffers to Rubato
struct PlanarBuffer<'a> {
    data: &'a [Vec<f32>],
    frames: usize,
}

impl<'a> Adapter<'a, f32> for PlanarBuffer<'a> {
    fn channels(&self) -> usize {
        self.data.len()
    }
    fn frames(&self) -> usize {
        self.frames
    }
    fn read_sample(&self, channel: usize, frame: usize) -> Option<f32> {
        self.data.get(channel).and_then(|ch| ch.get(frame)).copied()
    }
    unsafe fn read_sample_unchecked(&self, channel: usize, frame: usize) -> f32 {
        *self.data.get_unchecked(channel).get_unchecked(frame)
    }
}

struct FftConverter {
    resampler: Fft<f32>,
    input_buffer: VecDeque<f32>,
    planar: Vec<Vec<f32>>,
}

impl FftConverter {
    fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        let resampler = Fft::<f32>::new(
            source_rate as usize,
            target_rate as usize,
            FFT_CHUNK_SIZE,
            1,
            1,
            FixedSync::Input,
        )
        .map_err(|e| anyhow!("failed to create resampler {source_rate}->{target_rate}Hz: {e}"))?;
        Ok(Self {
            resampler,
            input_buffer: VecDeque::with_capacity(FFT_CHUNK_SIZE * 4),
            planar: vec![Vec::with_capacity(FFT_CHUNK_SIZE)],
        })
    }

    fn convert(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.input_buffer.extend(samples);
        let mut out = Vec::new();

        // The FFT resampler may round the requested chunk to its own block size
        let needed = self.resampler.input_frames_next();
        while self.input_buffer.len() >= needed {
            self.planar[0].clear();
            self.planar[0].extend(self.input_buffer.drain(..needed));

            let planar_input = PlanarBuffer {
                data: &self.planar,
                frames: needed,
            };
            let output = self
                .resampler
                .process(&planar_input, 0, None)
                .map_err(|e| anyhow!("resampler error: {e}"))?;
            out.extend((0..output.frames()).filter_map(|i| output.read_sample(0, i)));
        }
        Ok(out)
    }

    fn reset(&mut self) {
        self.input_buffer.clear();
        self.resampler.reset();
    }
}

enum RateConverter {
    Passthrough,
    Decimate(KaiserDecimator),
    Fft(Box<FftConverter>),
}

impl RateConverter {
    fn build(source_rate: u32, target_rate: u32) -> Result<Self> {
        if source_rate == target_rate {
            Ok(RateConverter::Passthrough)
        } else if source_rate == target_rate * DECIMATION_FACTOR as u32 {
            Ok(RateConverter::Decimate(KaiserDecimator::new()))
        } else {
            Ok(RateConverter::Fft(Box::new(FftConverter::new(source_rate, target_rate)?)))
        }
    }
}

/// Brings capture blocks to mono at the processing rate.
///
/// The converter is chosen from the first block's declared rate and rebuilt
/// whenever the device rate changes.
pub struct InputRateAdapter {
    target_rate: u32,
    source_rate: Option<u32>,
    converter: RateConverter,
    mix_buffer: Vec<f32>,
}

impl InputRateAdapter {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            source_rate: None,
            converter: RateConverter::Passthrough,
            mix_buffer: Vec::with_capacity(FFT_CHUNK_SIZE),
        }
    }

    fn downmix(&mut self, frame: &AudioFrame) -> &[f32] {
        self.mix_buffer.clear();
        if frame.channels > 1 {
            let ch_count = frame.channels as usize;
            for chunk in frame.samples.chunks_exact(ch_count) {
                self.mix_buffer.push(chunk.iter().sum::<f32>() / ch_count as f32);
            }
        } else {
            self.mix_buffer.extend_from_slice(&frame.samples);
        }
        &self.mix_buffer
    }

    fn ensure_converter(&mut self, source_rate: u32) -> Result<()> {
        if self.source_rate == Some(source_rate) {
            return Ok(());
        }
        self.converter = RateConverter::build(source_rate, self.target_rate)?;
        self.source_rate = Some(source_rate);
        let kind = match self.converter {
            RateConverter::Passthrough => "passthrough",
            RateConverter::Decimate(_) => "kaiser 2:1",
            RateConverter::Fft(_) => "fft",
        };
        tracing::info!(
            "input rate adapter: {}Hz -> {}Hz ({})",
            source_rate,
            self.target_rate,
            kind
        );
        Ok(())
    }
}

impl AudioProcessor for InputRateAdapter {
    fn process(&mut self, frame: AudioFrame) -> Result<Option<AudioFrame>> {
        if frame.sample_rate == 0 {
            bail!("capture block has no sample rate");
        }
        self.ensure_converter(frame.sample_rate)?;
        let timestamp = frame.timestamp;
        self.downmix(&frame);

        let samples = match &mut self.converter {
            RateConverter::Passthrough => std::mem::take(&mut self.mix_buffer),
            RateConverter::Decimate(d) => d.process(&self.mix_buffer),
            RateConverter::Fft(f) => f.convert(&self.mix_buffer)?,
        };
        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(AudioFrame::mono(samples, self.target_rate, timestamp)))
    }

    fn flush(&mut self) -> Vec<AudioFrame> {
        if let RateConverter::Fft(f) = &mut self.converter {
            if !f.input_buffer.is_empty() {
                tracing::debug!(
                    "dropping {} unconverted samples on flush",
                    f.input_buffer.len()
                );
                f.input_buffer.clear();
            }
        }
        Vec::new()
    }

    fn reset(&mut self) {
        match &mut self.converter {
            RateConverter::Passthrough => {}
            RateConverter::Decimate(d) => d.reset(),
            RateConverter::Fft(f) => f.reset(),
        }
    }

    fn name(&self) -> &'static str {
        "input_adapter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, rate: f64, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() as f32)
            .collect()
    }

    #[test]
    fn coefficients_have_unity_dc_gain() {
        let d = KaiserDecimator::new();
        assert_eq!(d.coefficients().len(), FILTER_ORDER + 1);
        let sum: f64 = d.coefficients().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum = {sum}");
    }

    #[test]
    fn coefficients_are_symmetric() {
        let c = design_kaiser_lowpass(FILTER_ORDER, FILTER_CUTOFF, KAISER_BETA);
        for i in 0..c.len() / 2 {
            assert!((c[i] - c[c.len() - 1 - i]).abs() < 1e-12);
        }
    }

    #[test]
    fn bessel_i0_known_values() {
        assert_eq!(bessel_i0(0.0), 1.0);
        assert!((bessel_i0(1.0) - 1.266_065_877_752_008_4).abs() < 1e-9);
    }

    #[test]
    fn output_is_half_of_even_input() {
        let mut d = KaiserDecimator::new();
        for len in [2, 10, 62, 64, 480, 2400] {
            assert_eq!(d.process(&vec![0.1; len]).len(), len / 2);
        }
    }

    #[test]
    fn odd_blocks_keep_stream_parity() {
        for block in [127, 441] {
            let mut d = KaiserDecimator::new();
            let total: usize = vec![0.1_f32; 48_000]
                .chunks(block)
                .map(|chunk| d.process(chunk).len())
                .sum();
            assert_eq!(total, 24_000, "block {block}");
        }

        let mut d = KaiserDecimator::new();
        assert_eq!(d.process(&[0.1; 7]).len(), 4);
        assert_eq!(d.process(&[0.1; 7]).len(), 3);
        assert_eq!(d.process(&[0.1; 1]).len(), 1);
        assert_eq!(d.process(&[0.1; 1]).len(), 0);
    }

    #[test]
    fn odd_blocks_match_single_call() {
        let input = sine(440.0, 48_000.0, 4800, 0.3);
        let expected = KaiserDecimator::new().process(&input);

        let mut split = KaiserDecimator::new();
        let actual: Vec<f32> = input.chunks(127).flat_map(|chunk| split.process(chunk)).collect();

        assert_eq!(actual.len(), expected.len());
        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn input_adapter_keeps_every_sample_across_odd_blocks() {
        for block in [127, 441] {
            let mut a = InputRateAdapter::new(24_000);
            let input = sine(440.0, 48_000.0, 48_000, 0.2);
            let produced: usize = input
                .chunks(block)
                .filter_map(|b| a.process(AudioFrame::mono(b.to_vec(), 48_000, 0)).unwrap())
                .map(|out| out.samples.len())
                .sum();
            assert_eq!(produced, 24_000, "block {block}");
        }
    }

    #[test]
    fn split_calls_match_single_call() {
        let input = sine(440.0, 48_000.0, 4800, 0.3);

        let mut whole = KaiserDecimator::new();
        let expected = whole.process(&input);

        let mut split = KaiserDecimator::new();
        let mut actual = Vec::new();
        for chunk in input.chunks(480) {
            actual.extend(split.process(chunk));
        }
        // Odd-sized pieces shorter than the filter order exercise the partial history path
        let mut small = KaiserDecimator::new();
        let mut small_out = Vec::new();
        for chunk in input.chunks(20) {
            small_out.extend(small.process(chunk));
        }

        assert_eq!(actual.len(), expected.len());
        let err: f32 = expected
            .iter()
            .zip(&actual)
            .skip(FILTER_ORDER)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt();
        assert!(err < 1e-3, "l2 error {err}");

        let small_err: f32 = expected
            .iter()
            .zip(&small_out)
            .skip(FILTER_ORDER)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt();
        assert!(small_err < 1e-3, "l2 error {small_err}");
    }

    #[test]
    fn passes_low_frequencies_and_rejects_high() {
        let mut low = KaiserDecimator::new();
        let out = low.process(&sine(1000.0, 48_000.0, 4800, 0.5));
        let peak = out[100..].iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.02, "peak {peak}");

        let mut high = KaiserDecimator::new();
        let out = high.process(&sine(20_000.0, 48_000.0, 4800, 0.5));
        let peak = out[100..].iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        assert!(peak < 0.01, "peak {peak}");
    }

    #[test]
    fn reset_clears_history() {
        let mut d = KaiserDecimator::new();
        d.process(&vec![1.0; 200]);
        d.reset();
        let out = d.process(&[0.0; 10]);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn decimation_processor_halves_rate() {
        let mut p = DecimationProcessor::new(48_000);
        let out = p.process(AudioFrame::mono(vec![0.0; 480], 48_000, 0)).unwrap().unwrap();
        assert_eq!(out.sample_rate, 24_000);
        assert_eq!(out.samples.len(), 240);
        assert!(p.process(AudioFrame::mono(vec![0.0; 480], 24_000, 0)).is_err());
    }

    #[test]
    fn input_adapter_downmixes_stereo_passthrough() {
        let mut a = InputRateAdapter::new(48_000);
        let stereo = AudioFrame {
            samples: vec![0.2, 0.4, -1.0, 1.0],
            sample_rate: 48_000,
            channels: 2,
            timestamp: 0,
        };
        let out = a.process(stereo).unwrap().unwrap();
        assert_eq!(out.channels, 1);
        assert_eq!(out.samples.len(), 2);
        assert!((out.samples[0] - 0.3).abs() < 1e-6);
        assert_eq!(out.samples[1], 0.0);
    }

    #[test]
    fn input_adapter_decimates_double_rate() {
        let mut a = InputRateAdapter::new(24_000);
        let out = a.process(AudioFrame::mono(vec![0.1; 128], 48_000, 0)).unwrap().unwrap();
        assert_eq!(out.sample_rate, 24_000);
        assert_eq!(out.samples.len(), 64);
    }

    #[test]
    fn input_adapter_resamples_arbitrary_rate() {
        let mut a = InputRateAdapter::new(48_000);
        let input = sine(440.0, 44_100.0, 44_100, 0.2);
        let mut produced = 0;
        for block in input.chunks(441) {
            if let Some(out) = a.process(AudioFrame::mono(block.to_vec(), 44_100, 0)).unwrap() {
                assert_eq!(out.sample_rate, 48_000);
                produced += out.samples.len();
            }
        }
        // One second in, roughly one second out (minus the buffered tail)
        assert!(produced > 45_000 && produced <= 48_000, "produced {produced}");
    }
}
