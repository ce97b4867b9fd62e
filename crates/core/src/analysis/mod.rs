use std::{f32::consts::PI, fmt, sync::Arc};

use crossbeam_channel::{Receiver, Sender};
use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{Result, ToyboxError};

/// Analysis size used when nothing else is configured.
pub const DEFAULT_FFT_SIZE: usize = 256;

/// Lower edge of the dB window mapped onto the byte range.
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = 0.0;
const MAGNITUDE_EPSILON: f32 = 1e-12;

/// Frequency-domain summary of one block of `fft_size` samples.
///
/// `frequency_data` is owned by whoever receives the frame. Hand it back via
/// [`FrameRecycler::recycle`] to let the analyser reuse the allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFrame {
    /// Zero-based position of this frame in the analysed stream.
    pub index: u64,
    /// One byte intensity per bin, `fft_size / 2` entries.
    pub frequency_data: Vec<u8>,
    /// Root mean square of the raw (unwindowed) block.
    pub rms: f32,
}

impl AnalysisFrame {
    pub fn bin_count(&self) -> usize {
        self.frequency_data.len()
    }

    /// Index of the loudest bin, if any bin is above zero.
    pub fn peak_bin(&self) -> Option<usize> {
        self.frequency_data
            .iter()
            .enumerate()
            .filter(|(_, value)| **value > 0)
            .max_by_key(|(_, value)| **value)
            .map(|(index, _)| index)
    }
}

/// Returns an error unless `size` is a power of two of at least 2.
pub fn validate_fft_size(size: usize) -> Result<()> {
    if size >= 2 && size.is_power_of_two() {
        Ok(())
    } else {
        Err(ToyboxError::InvalidFftSize { size })
    }
}

/// Ring-buffered spectral analyser.
///
/// Samples accumulate into a fixed buffer of `fft_size` entries; every time it
/// fills, one [`AnalysisFrame`] is produced and the cursor starts over. Frames
/// never overlap. All working memory is allocated up front.
pub struct SpectralAnalyser {
    fft_size: usize,
    ring: Vec<f32>,
    cursor: usize,
    window: Vec<f32>,
    norm: f32,
    frames_emitted: u64,
    fft: FftResources,
    pool_tx: Sender<Vec<u8>>,
    pool_rx: Receiver<Vec<u8>>,
}

impl SpectralAnalyser {
    /// Creates an analyser for blocks of `fft_size` samples.
    pub fn new(fft_size: usize) -> Result<Self> {
        validate_fft_size(fft_size)?;

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(fft_size);
        let fft = FftResources {
            input: plan.make_input_vec(),
            spectrum: plan.make_output_vec(),
            scratch: plan.make_scratch_vec(),
            plan,
        };
        let (pool_tx, pool_rx) = crossbeam_channel::bounded(8);

        Ok(Self {
            fft_size,
            ring: vec![0.0; fft_size],
            cursor: 0,
            window: hann_window(fft_size),
            norm: 2.0 / fft_size as f32,
            frames_emitted: 0,
            fft,
            pool_tx,
            pool_rx,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Handle the consumer uses to return frame buffers for reuse.
    pub fn recycler(&self) -> FrameRecycler {
        FrameRecycler {
            pool: self.pool_tx.clone(),
        }
    }

    /// Feeds one processing quantum through the ring buffer, calling `emit`
    /// for every completed block.
    ///
    /// Always returns `true` so the hosting loop keeps running, including
    /// for empty quanta, which are skipped without emitting anything.
    pub fn process<F>(&mut self, quantum: &[f32], mut emit: F) -> bool
    where
        F: FnMut(AnalysisFrame),
    {
        for &sample in quantum {
            self.ring[self.cursor] = sample;
            self.cursor += 1;
            if self.cursor == self.fft_size {
                let frame = self.analyse();
                self.cursor = 0;
                emit(frame);
            }
        }
        true
    }

    fn analyse(&mut self) -> AnalysisFrame {
        let rms = compute_rms(&self.ring);

        for ((slot, sample), weight) in self
            .fft
            .input
            .iter_mut()
            .zip(&self.ring)
            .zip(&self.window)
        {
            *slot = sample * weight;
        }

        // Buffer lengths are fixed by the plan, so this cannot fail.
        if let Err(err) = self.fft.plan.process_with_scratch(
            &mut self.fft.input,
            &mut self.fft.spectrum,
            &mut self.fft.scratch,
        ) {
            tracing::error!(%err, "fft pass failed");
        }

        let bins = self.bin_count();
        let mut frequency_data = self.take_buffer();
        for (byte, bin) in frequency_data.iter_mut().zip(&self.fft.spectrum[..bins]) {
            *byte = magnitude_to_byte(bin.norm(), self.norm);
        }

        let frame = AnalysisFrame {
            index: self.frames_emitted,
            frequency_data,
            rms,
        };
        self.frames_emitted += 1;
        frame
    }

    fn take_buffer(&self) -> Vec<u8> {
        let bins = self.bin_count();
        match self.pool_rx.try_recv() {
            Ok(mut buffer) => {
                buffer.resize(bins, 0);
                buffer
            }
            Err(_) => vec![0; bins],
        }
    }
}

impl fmt::Debug for SpectralAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyser")
            .field("fft_size", &self.fft_size)
            .field("cursor", &self.cursor)
            .field("frames_emitted", &self.frames_emitted)
            .finish()
    }
}

/// Returns spent frame buffers to the analyser that produced them.
#[derive(Debug, Clone)]
pub struct FrameRecycler {
    pool: Sender<Vec<u8>>,
}

impl FrameRecycler {
    /// Hands the frame's buffer back. Dropped silently when the pool is full.
    pub fn recycle(&self, frame: AnalysisFrame) {
        let _ = self.pool.try_send(frame.frequency_data);
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

/// Root mean square of `samples`; zero for an empty slice.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Maps a raw bin magnitude onto `[0, 255]` through the `[-100, 0]` dB window.
pub fn magnitude_to_byte(magnitude: f32, norm: f32) -> u8 {
    let db = 20.0 * (magnitude * norm + MAGNITUDE_EPSILON).log10();
    let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(0.0, 255.0) as u8
}

fn hann_window(len: usize) -> Vec<f32> {
    if len <= 1 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| 0.5 - 0.5 * ((2.0 * PI * i as f32) / (len as f32 - 1.0)).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, cycles: f32, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * cycles * i as f32 / len as f32).sin())
            .collect()
    }

    fn collect_frames(analyser: &mut SpectralAnalyser, samples: &[f32]) -> Vec<AnalysisFrame> {
        let mut frames = Vec::new();
        analyser.process(samples, |frame| frames.push(frame));
        frames
    }

    #[test]
    fn rejects_sizes_that_are_not_powers_of_two() {
        for size in [0, 1, 3, 100, 255, 1000] {
            let err = SpectralAnalyser::new(size).unwrap_err();
            assert!(matches!(err, ToyboxError::InvalidFftSize { .. }), "size {size}");
        }
    }

    #[test]
    fn emits_one_frame_per_block_for_every_valid_size() {
        for k in 1..=11 {
            let size = 1usize << k;
            let mut analyser = SpectralAnalyser::new(size).unwrap();
            let samples = sine(size * 3 + size / 2, 4.0, 0.5);
            let frames = collect_frames(&mut analyser, &samples);

            assert_eq!(frames.len(), 3, "size {size}");
            for frame in &frames {
                assert_eq!(frame.frequency_data.len(), size / 2);
            }
        }
    }

    #[test]
    fn frames_span_quantum_boundaries_without_overlap() {
        let mut analyser = SpectralAnalyser::new(256).unwrap();
        let mut frames = Vec::new();
        for chunk in sine(1024, 8.0, 0.5).chunks(128) {
            analyser.process(chunk, |frame| frames.push(frame));
        }

        assert_eq!(frames.len(), 4);
        let indices: Vec<u64> = frames.iter().map(|frame| frame.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_quantum_keeps_running_without_output() {
        let mut analyser = SpectralAnalyser::new(64).unwrap();
        let mut emitted = 0;
        assert!(analyser.process(&[], |_| emitted += 1));
        assert!(analyser.process(&vec![0.25; 64], |_| emitted += 1));
        assert!(analyser.process(&[], |_| emitted += 1));
        assert_eq!(emitted, 1);
    }

    #[test]
    fn silence_has_zero_rms_and_floor_intensity() {
        let mut analyser = SpectralAnalyser::new(128).unwrap();
        let frames = collect_frames(&mut analyser, &vec![0.0; 128]);

        assert_eq!(frames[0].rms, 0.0);
        assert!(frames[0].frequency_data.iter().all(|value| *value == 0));
        assert_eq!(frames[0].peak_bin(), None);
    }

    #[test]
    fn rms_grows_with_amplitude() {
        let mut previous = 0.0;
        for amplitude in [0.0, 0.1, 0.25, 0.5, 1.0] {
            let rms = compute_rms(&sine(256, 3.0, amplitude));
            assert!(rms >= previous);
            previous = rms;
        }
        assert!((compute_rms(&[1.0; 16]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rms_ignores_the_window() {
        let mut analyser = SpectralAnalyser::new(64).unwrap();
        let frames = collect_frames(&mut analyser, &vec![0.5; 64]);
        assert!((frames[0].rms - 0.5).abs() < 1e-6);
    }

    #[test]
    fn pure_tone_peaks_at_its_bin() {
        let mut analyser = SpectralAnalyser::new(256).unwrap();
        let frames = collect_frames(&mut analyser, &sine(256, 16.0, 0.8));

        assert_eq!(frames[0].peak_bin(), Some(16));
        assert!(frames[0].frequency_data[16] > 200);
    }

    #[test]
    fn byte_mapping_is_monotonic_and_clamped() {
        let norm = 2.0 / 256.0;
        let mut previous = 0u8;
        for step in 0..=2000 {
            let magnitude = step as f32 * 0.5;
            let value = magnitude_to_byte(magnitude, norm);
            assert!(value >= previous);
            previous = value;
        }
        assert_eq!(magnitude_to_byte(0.0, norm), 0);
        assert_eq!(magnitude_to_byte(1e9, norm), 255);
        assert_eq!(magnitude_to_byte(f32::NAN, norm), 0);
    }

    #[test]
    fn recycled_buffers_are_reused() {
        let mut analyser = SpectralAnalyser::new(32).unwrap();
        let recycler = analyser.recycler();

        let first = collect_frames(&mut analyser, &[0.1; 32]).remove(0);
        let pointer = first.frequency_data.as_ptr();
        recycler.recycle(first);

        let second = collect_frames(&mut analyser, &[0.1; 32]).remove(0);
        assert_eq!(second.frequency_data.as_ptr(), pointer);
        assert_eq!(second.frequency_data.len(), 16);
    }
}
