//! Direction-of-arrival estimation.
//!
//! `DoaProcessor` turns multichannel capture blocks into a 360-degree
//! azimuth likelihood heatmap at the configured update cadence. Healthy
//! geometry drives the full SRP-PHAT scan; degenerate geometry drops to the
//! canonical-pair GCC-PHAT fallback with zero confidence.

pub mod gcc_phat;
pub mod geometry;
pub mod heatmap;
pub mod srp_phat;

pub use geometry::{ArrayGeometry, Degeneracy};

use std::collections::VecDeque;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use crate::config::{AudioConfig, DoaConfig};
use crate::error::{FocusFieldError, Result};
use crate::messages::{AudioFrame, DoaHeatmap, VoiceActivity};

use gcc_phat::GccPhatFallback;
use heatmap::HeatmapPost;
use srp_phat::SrpPhatEngine;

enum Engine {
    Srp(SrpPhatEngine),
    /// Degenerate geometry: pairwise fallback, confidence pinned to zero.
    Gcc(GccPhatFallback),
}

pub struct DoaProcessor {
    channels: usize,
    fft_len: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    /// Selected (fft bin, frequency Hz) pairs of the analysis band.
    freq_bins: Vec<(usize, f32)>,
    engine: Engine,
    post: HeatmapPost,
    bin_count: usize,
    bin_size_deg: f32,
    update_interval_ns: u64,
    block_interval_ns: u64,
    gate_on_vad: bool,
    vad_downweight: f32,
    /// Sliding per-channel sample windows, most recent `fft_len` samples.
    accum: Vec<VecDeque<f32>>,
    last_emit_t_ns: Option<u64>,
    seq: u64,
    degraded: bool,
}

impl DoaProcessor {
    pub fn new(audio: &AudioConfig, doa: &DoaConfig, geometry: ArrayGeometry) -> Result<Self> {
        let bin_count = (360.0 / doa.bin_size_deg).round() as usize;
        let fft_len = audio.block_samples.next_power_of_two();
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_len);

        let window: Vec<f32> = (0..fft_len)
            .map(|n| {
                let phase = 2.0 * std::f32::consts::PI * n as f32 / fft_len as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        let hz_per_bin = audio.sample_rate_hz as f32 / fft_len as f32;
        let k_lo = ((doa.freq_band_hz[0] / hz_per_bin).ceil() as usize).max(1);
        let k_hi = ((doa.freq_band_hz[1] / hz_per_bin).floor() as usize).min(fft_len / 2);
        if k_lo > k_hi {
            return Err(FocusFieldError::DoaFault {
                message: format!(
                    "frequency band {:?} selects no FFT bins at block size {}",
                    doa.freq_band_hz, audio.block_samples
                ),
            });
        }
        let freq_bins: Vec<(usize, f32)> = (k_lo..=k_hi).map(|k| (k, k as f32 * hz_per_bin)).collect();

        let degraded = geometry.degeneracy().is_some();
        let engine = if degraded {
            Engine::Gcc(GccPhatFallback::new(&geometry, bin_count, doa.bin_size_deg))
        } else {
            Engine::Srp(SrpPhatEngine::new(&geometry, bin_count, doa.bin_size_deg))
        };

        let block_interval_ns =
            (audio.block_samples as u64).saturating_mul(1_000_000_000) / audio.sample_rate_hz as u64;

        Ok(Self {
            channels: audio.channels,
            fft_len,
            fft,
            window,
            freq_bins,
            engine,
            post: HeatmapPost::new(doa.bin_size_deg, doa.smoothing_alpha, doa.top_k_peaks),
            bin_count,
            bin_size_deg: doa.bin_size_deg,
            update_interval_ns: (1_000_000_000.0 / doa.update_hz) as u64,
            block_interval_ns,
            gate_on_vad: doa.gate_on_vad,
            vad_downweight: doa.vad_downweight,
            accum: vec![VecDeque::with_capacity(fft_len); audio.channels],
            last_emit_t_ns: None,
            seq: 0,
            degraded,
        })
    }

    /// True when running on the GCC-PHAT fallback; logged once at startup
    /// as `doa.geometry_degraded`.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Accumulates one capture block; emits a heatmap when the window is
    /// full and waiting one more block would miss the update cadence.
    pub fn process(
        &mut self,
        frame: &AudioFrame,
        vad: Option<&VoiceActivity>,
    ) -> Result<Option<DoaHeatmap>> {
        if frame.channels != self.channels {
            return Err(FocusFieldError::DoaFault {
                message: format!(
                    "frame has {} channels, geometry expects {}",
                    frame.channels, self.channels
                ),
            });
        }

        for ch in 0..self.channels {
            let accum = &mut self.accum[ch];
            for sample in frame.channel_samples(ch) {
                if accum.len() == self.fft_len {
                    accum.pop_front();
                }
                accum.push_back(sample);
            }
        }

        if self.accum[0].len() < self.fft_len {
            return Ok(None);
        }
        if let Some(last) = self.last_emit_t_ns {
            let elapsed = frame.t_ns.saturating_sub(last);
            if elapsed + self.block_interval_ns <= self.update_interval_ns {
                return Ok(None);
            }
        }
        self.last_emit_t_ns = Some(frame.t_ns);

        Ok(Some(self.compute(frame.t_ns, vad)))
    }

    fn compute(&mut self, t_ns: u64, vad: Option<&VoiceActivity>) -> DoaHeatmap {
        let spectra = self.spectra();

        let mut raw = match &self.engine {
            Engine::Srp(engine) => engine.steered_power(&spectra, &self.freq_bins),
            Engine::Gcc(fallback) => {
                let scan = fallback.steered_power(&spectra, &self.freq_bins);
                fallback.broaden(&scan)
            }
        };
        HeatmapPost::normalize(&mut raw);

        let mut scores = raw.clone();
        self.post.smooth(&mut scores);
        let peaks = self.post.pick_peaks(&scores, &raw);

        let mut confidence = if self.degraded {
            0.0
        } else {
            HeatmapPost::confidence(&scores)
        };
        let mut low_confidence = false;
        if self.gate_on_vad
            && let Some(vad) = vad
            && !vad.speech
        {
            low_confidence = true;
            confidence *= self.vad_downweight;
        }

        self.seq += 1;
        DoaHeatmap {
            t_ns,
            seq: self.seq,
            bin_count: self.bin_count,
            bin_size_deg: self.bin_size_deg,
            scores,
            peaks,
            confidence,
            low_confidence,
        }
    }

    fn spectra(&self) -> Vec<Vec<Complex<f32>>> {
        let mut spectra = Vec::with_capacity(self.channels);
        for accum in &self.accum {
            let mut input: Vec<f32> = accum
                .iter()
                .zip(&self.window)
                .map(|(&s, &w)| s * w)
                .collect();
            let mut output = self.fft.make_output_vec();
            // realfft rejects all-zero edge cases only on length mismatch;
            // the planner guarantees the sizes line up here.
            let _ = self.fft.process(&mut input, &mut output);
            spectra.push(output);
        }
        spectra
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Deterministic synthetic plane waves for DOA tests.

    use super::*;

    /// Square array: supports the full SRP scan.
    pub fn square_array() -> ArrayGeometry {
        ArrayGeometry::new(
            vec![[0.05, 0.05], [0.05, -0.05], [-0.05, -0.05], [-0.05, 0.05]],
            343.0,
        )
        .unwrap()
    }

    /// Linear array along x: collinear, exercises the fallback.
    pub fn linear_array() -> ArrayGeometry {
        ArrayGeometry::new(
            vec![[-0.06, 0.0], [-0.02, 0.0], [0.02, 0.0], [0.06, 0.0]],
            343.0,
        )
        .unwrap()
    }

    /// Multitone source signal; fixed phases keep runs reproducible.
    pub fn source_sample(t_s: f32) -> f32 {
        const TONES_HZ: [f32; 6] = [400.0, 700.0, 1100.0, 1600.0, 2300.0, 3100.0];
        TONES_HZ
            .iter()
            .enumerate()
            .map(|(m, &f)| {
                (2.0 * std::f32::consts::PI * f * t_s + m as f32 * 0.7).sin() / TONES_HZ.len() as f32
            })
            .sum()
    }

    /// Interleaved samples of a plane wave from `bearing_deg` as seen by
    /// the array. Earlier arrival (larger projection) means the channel
    /// leads the reference waveform.
    pub fn plane_wave_samples(
        geometry: &ArrayGeometry,
        bearing_deg: f32,
        sample_rate_hz: u32,
        frames: usize,
    ) -> Vec<f32> {
        let channels = geometry.channels();
        let mut samples = vec![0.0f32; frames * channels];
        for ch in 0..channels {
            let delay_s = geometry.delay_s(ch, bearing_deg);
            for n in 0..frames {
                let t_s = n as f32 / sample_rate_hz as f32 + delay_s;
                samples[n * channels + ch] = source_sample(t_s);
            }
        }
        samples
    }

    /// Windowed per-channel spectra plus the default analysis band.
    pub fn plane_wave_spectra(
        geometry: &ArrayGeometry,
        bearing_deg: f32,
        sample_rate_hz: u32,
        fft_len: usize,
    ) -> (Vec<Vec<Complex<f32>>>, Vec<(usize, f32)>) {
        let interleaved = plane_wave_samples(geometry, bearing_deg, sample_rate_hz, fft_len);
        let channels = geometry.channels();
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_len);

        let mut spectra = Vec::with_capacity(channels);
        for ch in 0..channels {
            let mut input: Vec<f32> = (0..fft_len)
                .map(|n| {
                    let phase = 2.0 * std::f32::consts::PI * n as f32 / fft_len as f32;
                    interleaved[n * channels + ch] * 0.5 * (1.0 - phase.cos())
                })
                .collect();
            let mut output = fft.make_output_vec();
            fft.process(&mut input, &mut output).unwrap();
            spectra.push(output);
        }

        let hz_per_bin = sample_rate_hz as f32 / fft_len as f32;
        let k_lo = (300.0 / hz_per_bin).ceil() as usize;
        let k_hi = (3800.0 / hz_per_bin).floor() as usize;
        let freq_bins = (k_lo..=k_hi).map(|k| (k, k as f32 * hz_per_bin)).collect();
        (spectra, freq_bins)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::config::{AudioConfig, DoaConfig};

    fn audio_config(channels: usize) -> AudioConfig {
        AudioConfig {
            channels,
            block_samples: 1024,
            ..AudioConfig::default()
        }
    }

    fn frame_at(t_ns: u64, seq: u64, samples: Vec<f32>, channels: usize) -> AudioFrame {
        AudioFrame::new(t_ns, seq, 16_000, channels, samples)
    }

    fn vad(speech: bool) -> VoiceActivity {
        VoiceActivity {
            t_ns: 0,
            seq: 0,
            speech,
            confidence: if speech { 0.9 } else { 0.1 },
        }
    }

    #[test]
    fn test_square_array_uses_srp() {
        let processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        assert!(!processor.is_degraded());
    }

    #[test]
    fn test_linear_array_is_degraded() {
        let processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), linear_array()).unwrap();
        assert!(processor.is_degraded());
    }

    #[test]
    fn test_emits_after_window_full() {
        let mut processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        let samples = plane_wave_samples(&square_array(), 90.0, 16_000, 1024);
        let heatmap = processor
            .process(&frame_at(0, 1, samples, 4), Some(&vad(true)))
            .unwrap();
        assert!(heatmap.is_some());
        let heatmap = heatmap.unwrap();
        assert_eq!(heatmap.bin_count, 180);
        assert_eq!(heatmap.scores.len(), 180);
    }

    #[test]
    fn test_heatmap_invariants_hold() {
        let mut processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        let samples = plane_wave_samples(&square_array(), 210.0, 16_000, 1024);
        let heatmap = processor
            .process(&frame_at(0, 1, samples, 4), Some(&vad(true)))
            .unwrap()
            .unwrap();
        let max = heatmap.scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert!(max <= 1.0 + 1e-6);
        assert!(
            heatmap
                .peaks
                .iter()
                .all(|p| (0.0..360.0).contains(&p.angle_deg))
        );
    }

    #[test]
    fn test_peak_tracks_source_bearing() {
        let mut processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        let samples = plane_wave_samples(&square_array(), 90.0, 16_000, 1024);
        let heatmap = processor
            .process(&frame_at(0, 1, samples, 4), Some(&vad(true)))
            .unwrap()
            .unwrap();
        let top = heatmap.peaks.first().expect("peak expected");
        assert!(crate::messages::angular_distance_deg(top.angle_deg, 90.0) <= 4.0);
        assert!(heatmap.confidence > 0.3);
    }

    #[test]
    fn test_silence_gives_flat_zero_confidence() {
        let mut processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        let heatmap = processor
            .process(&frame_at(0, 1, vec![0.0; 4096], 4), Some(&vad(false)))
            .unwrap()
            .unwrap();
        assert!(heatmap.scores.iter().all(|&s| s == 0.0));
        assert!(heatmap.peaks.is_empty());
        assert_eq!(heatmap.confidence, 0.0);
        assert!(heatmap.low_confidence);
    }

    #[test]
    fn test_vad_gate_downweights_but_still_emits() {
        let mut processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        let samples = plane_wave_samples(&square_array(), 90.0, 16_000, 1024);
        let gated = processor
            .process(&frame_at(0, 1, samples.clone(), 4), Some(&vad(false)))
            .unwrap()
            .unwrap();
        assert!(gated.low_confidence);
        assert!(!gated.peaks.is_empty(), "peaks are kept under the gate");

        let mut ungated =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        let open = ungated
            .process(&frame_at(0, 1, samples, 4), Some(&vad(true)))
            .unwrap()
            .unwrap();
        assert!(gated.confidence < open.confidence);
    }

    #[test]
    fn test_update_cadence_decimates() {
        let config = DoaConfig {
            update_hz: 5.0,
            ..DoaConfig::default()
        };
        let mut processor =
            DoaProcessor::new(&audio_config(4), &config, square_array()).unwrap();
        let samples = plane_wave_samples(&square_array(), 45.0, 16_000, 1024);
        let block_ns = 64_000_000u64; // 1024 samples at 16kHz

        let mut emitted = 0;
        for i in 0..16u64 {
            let frame = frame_at(i * block_ns, i + 1, samples.clone(), 4);
            if processor.process(&frame, Some(&vad(true))).unwrap().is_some() {
                emitted += 1;
            }
        }
        // 16 blocks cover ~1.02s; 5Hz must emit at least 5, but decimation
        // must cut well below the 16 capture blocks.
        assert!((5..=9).contains(&emitted), "emitted {emitted}");
    }

    #[test]
    fn test_channel_mismatch_is_fault() {
        let mut processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        let result = processor.process(&frame_at(0, 1, vec![0.0; 1024], 2), None);
        assert!(matches!(result, Err(FocusFieldError::DoaFault { .. })));
    }

    #[test]
    fn test_degraded_path_zero_confidence_with_peak() {
        let mut processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), linear_array()).unwrap();
        let samples = plane_wave_samples(&linear_array(), 90.0, 16_000, 1024);
        let heatmap = processor
            .process(&frame_at(0, 1, samples, 4), Some(&vad(true)))
            .unwrap()
            .unwrap();
        assert_eq!(heatmap.confidence, 0.0);
        let top = heatmap.peaks.first().expect("broad peak expected");
        assert!(crate::messages::angular_distance_deg(top.angle_deg, 90.0) <= 4.0);
        assert!(!heatmap.low_confidence);
    }

    #[test]
    fn test_seq_strictly_increasing() {
        let mut processor =
            DoaProcessor::new(&audio_config(4), &DoaConfig::default(), square_array()).unwrap();
        let samples = plane_wave_samples(&square_array(), 45.0, 16_000, 1024);
        let mut last_seq = 0;
        for i in 0..6u64 {
            if let Some(h) = processor
                .process(
                    &frame_at(i * 64_000_000, i + 1, samples.clone(), 4),
                    Some(&vad(true)),
                )
                .unwrap()
            {
                assert_eq!(h.seq, last_seq + 1);
                last_seq = h.seq;
            }
        }
        assert!(last_seq >= 2);
    }
}
