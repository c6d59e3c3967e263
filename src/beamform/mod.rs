//! Delay-and-sum beamformer.
//!
//! Aligns the channels toward the locked bearing with fractional-sample
//! windowed-sinc delays and averages them, so on-axis sound adds coherently
//! and off-axis sound averages down. Exactly one monaural block is emitted
//! per input block; the only buffering is a per-channel history ring bounded
//! by the array aperture, so added latency stays fixed.

use crate::config::{BeamformConfig, NoLockBehavior};
use crate::doa::ArrayGeometry;
use crate::messages::{AudioFrame, AudioStats, EnhancedAudio, LockState, TargetLock};

/// Half-width of the windowed-sinc interpolation kernel, in samples.
const SINC_HALF: usize = 4;

const ENERGY_EPS: f32 = 1e-12;

/// Cap on the reported suppression estimate.
const SUPPRESSION_CAP_DB: f32 = 60.0;

/// Raised when the beamformer changes degradation state; the station logs
/// it once per episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeamformNotice {
    Degraded { message: String },
    Recovered,
}

pub struct DelayAndSumBeamformer {
    geometry: ArrayGeometry,
    sample_rate_hz: u32,
    config: BeamformConfig,
    /// Per-channel tail of previous blocks, `hist_len` samples each.
    history: Vec<Vec<f32>>,
    hist_len: usize,
    /// Cached steering shifts for the last bearing, in fractional samples.
    steer_cache: Option<(f32, Vec<f32>)>,
    last_bearing_deg: Option<f32>,
    /// Output envelope gain; ramps between 0 and 1 to avoid clicks.
    gain: f32,
    fade_step: f32,
    degraded: bool,
}

impl DelayAndSumBeamformer {
    pub fn new(geometry: ArrayGeometry, sample_rate_hz: u32, config: BeamformConfig) -> Self {
        let max_shift = (geometry.aperture_m() / geometry.speed_of_sound()
            * sample_rate_hz as f32)
            .ceil() as usize;
        let hist_len = max_shift + 2 * SINC_HALF + 2;
        let channels = geometry.channels();
        let fade_samples =
            (config.fade_ms as f32 / 1000.0 * sample_rate_hz as f32).max(1.0);
        Self {
            geometry,
            sample_rate_hz,
            config,
            history: vec![vec![0.0; hist_len]; channels],
            hist_len,
            steer_cache: None,
            last_bearing_deg: None,
            gain: 1.0,
            fade_step: 1.0 / fade_samples,
            degraded: false,
        }
    }

    /// Produces one enhanced block per input block, steered by the most
    /// recent TargetLock if it is fresh enough.
    pub fn process(
        &mut self,
        frame: &AudioFrame,
        lock: Option<&TargetLock>,
    ) -> (EnhancedAudio, Option<BeamformNotice>) {
        let mut notice = None;

        if frame.channels != self.geometry.channels() {
            if !self.degraded {
                self.degraded = true;
                notice = Some(BeamformNotice::Degraded {
                    message: format!(
                        "frame has {} channels, geometry expects {}; falling back to omni",
                        frame.channels,
                        self.geometry.channels()
                    ),
                });
            }
            let enhanced = self.emit(frame, self.omni(frame), 1.0);
            return (enhanced, notice);
        }
        if self.degraded {
            self.degraded = false;
            notice = Some(BeamformNotice::Recovered);
        }

        let bearing = self.steering_bearing(frame, lock);
        let mut target_gain = 1.0;
        let mono = match bearing {
            Some(bearing) => {
                self.last_bearing_deg = Some(bearing);
                self.steer(frame, bearing)
            }
            None => match self.config.no_lock_behavior {
                NoLockBehavior::Omni => self.omni(frame),
                NoLockBehavior::HoldLast => match self.last_bearing_deg {
                    Some(bearing) => self.steer(frame, bearing),
                    None => self.omni(frame),
                },
                NoLockBehavior::Mute => {
                    target_gain = 0.0;
                    self.omni(frame)
                }
            },
        };

        self.push_history(frame);
        let enhanced = self.emit(frame, mono, target_gain);
        (enhanced, notice)
    }

    /// The bearing to steer toward, or None when the lock is absent, empty,
    /// or older than `use_last_lock_ms` relative to the audio clock.
    fn steering_bearing(&self, frame: &AudioFrame, lock: Option<&TargetLock>) -> Option<f32> {
        let lock = lock?;
        if lock.state == LockState::NoLock {
            return None;
        }
        let age_ns = frame.t_ns.saturating_sub(lock.t_ns);
        if age_ns > self.config.use_last_lock_ms * 1_000_000 {
            return None;
        }
        lock.target_bearing_deg
    }

    /// Plain channel average, no steering.
    fn omni(&self, frame: &AudioFrame) -> Vec<f32> {
        let channels = frame.channels.max(1);
        let mut mono = vec![0.0f32; frame.block_samples];
        for (n, out) in mono.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for ch in 0..channels {
                acc += frame.samples[n * channels + ch];
            }
            *out = acc / channels as f32;
        }
        mono
    }

    /// Aligns each channel onto the target bearing and averages. Channels
    /// that hear the wavefront earlier are delayed by their lead; the extra
    /// `SINC_HALF` shift keeps the interpolation kernel inside the buffer.
    fn steer(&mut self, frame: &AudioFrame, bearing_deg: f32) -> Vec<f32> {
        let shifts = self.steering_shifts(bearing_deg);
        let channels = frame.channels;
        let mut mono = vec![0.0f32; frame.block_samples];

        for ch in 0..channels {
            let ext: Vec<f32> = self.history[ch]
                .iter()
                .copied()
                .chain(frame.channel_samples(ch))
                .collect();
            let shift = shifts[ch];
            for (n, out) in mono.iter_mut().enumerate() {
                let pos = (self.hist_len + n) as f32 - shift;
                *out += sinc_interpolate(&ext, pos);
            }
        }
        for out in mono.iter_mut() {
            *out /= channels as f32;
        }
        mono
    }

    fn steering_shifts(&mut self, bearing_deg: f32) -> Vec<f32> {
        if let Some((cached_bearing, shifts)) = &self.steer_cache
            && *cached_bearing == bearing_deg
        {
            return shifts.clone();
        }
        let fs = self.sample_rate_hz as f32;
        let delays: Vec<f32> = (0..self.geometry.channels())
            .map(|ch| self.geometry.delay_s(ch, bearing_deg) * fs)
            .collect();
        let min = delays.iter().copied().fold(f32::INFINITY, f32::min);
        let shifts: Vec<f32> = delays
            .iter()
            .map(|d| d - min + SINC_HALF as f32)
            .collect();
        self.steer_cache = Some((bearing_deg, shifts.clone()));
        shifts
    }

    fn push_history(&mut self, frame: &AudioFrame) {
        for ch in 0..frame.channels.min(self.history.len()) {
            let history = &mut self.history[ch];
            let block: Vec<f32> = frame.channel_samples(ch).collect();
            if block.len() >= history.len() {
                let start = block.len() - history.len();
                history.copy_from_slice(&block[start..]);
            } else {
                history.drain(..block.len());
                history.extend_from_slice(&block);
            }
        }
    }

    /// Applies the fade envelope and assembles the output message.
    fn emit(&mut self, frame: &AudioFrame, mut mono: Vec<f32>, target_gain: f32) -> EnhancedAudio {
        for sample in mono.iter_mut() {
            if self.gain < target_gain {
                self.gain = (self.gain + self.fade_step).min(target_gain);
            } else if self.gain > target_gain {
                self.gain = (self.gain - self.fade_step).max(target_gain);
            }
            *sample *= self.gain;
        }

        let channels = frame.channels.max(1) as f32;
        let block = frame.block_samples.max(1) as f32;
        let input_energy = frame.samples.iter().map(|s| s * s).sum::<f32>() / channels / block;
        let output_energy = mono.iter().map(|s| s * s).sum::<f32>() / block;

        let suppression_db = if input_energy <= ENERGY_EPS {
            0.0
        } else if output_energy <= ENERGY_EPS {
            SUPPRESSION_CAP_DB
        } else {
            (10.0 * (input_energy / output_energy).log10()).clamp(-SUPPRESSION_CAP_DB, SUPPRESSION_CAP_DB)
        };

        EnhancedAudio {
            t_ns: frame.t_ns,
            seq: frame.seq,
            sample_rate_hz: frame.sample_rate_hz,
            block_samples: mono.len(),
            stats: AudioStats {
                rms: output_energy.sqrt(),
                clipped_samples: mono.iter().filter(|s| s.abs() > 1.0).count(),
                suppression_db,
            },
            samples: mono,
        }
    }
}

/// Windowed-sinc read at a fractional buffer position.
fn sinc_interpolate(ext: &[f32], pos: f32) -> f32 {
    let i0 = pos.floor() as isize;
    let frac = pos - i0 as f32;
    let mut acc = 0.0f32;
    for k in (1 - SINC_HALF as isize)..=(SINC_HALF as isize) {
        let idx = i0 + k;
        if idx < 0 || idx as usize >= ext.len() {
            continue;
        }
        let x = frac - k as f32;
        acc += ext[idx as usize] * sinc(x) * hann_window(x);
    }
    acc
}

fn sinc(x: f32) -> f32 {
    if x.abs() < 1e-6 {
        1.0
    } else {
        let pix = std::f32::consts::PI * x;
        pix.sin() / pix
    }
}

fn hann_window(x: f32) -> f32 {
    let h = SINC_HALF as f32;
    if x.abs() >= h {
        0.0
    } else {
        0.5 * (1.0 + (std::f32::consts::PI * x / h).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BeamformConfig;
    use crate::messages::{LockMode, LockStability};

    fn square_array() -> ArrayGeometry {
        ArrayGeometry::new(
            vec![[0.05, 0.05], [0.05, -0.05], [-0.05, -0.05], [-0.05, 0.05]],
            343.0,
        )
        .unwrap()
    }

    fn beamformer(config: BeamformConfig) -> DelayAndSumBeamformer {
        DelayAndSumBeamformer::new(square_array(), 16_000, config)
    }

    fn lock_at(t_ns: u64, bearing: f32) -> TargetLock {
        TargetLock {
            t_ns,
            seq: 1,
            state: LockState::Locked,
            mode: LockMode::AvLock,
            target_id: Some("a".to_string()),
            target_bearing_deg: Some(bearing),
            confidence: 0.9,
            reason: "tracking".to_string(),
            stability: LockStability::default(),
        }
    }

    fn no_lock(t_ns: u64) -> TargetLock {
        TargetLock {
            t_ns,
            seq: 1,
            state: LockState::NoLock,
            mode: LockMode::NoLock,
            target_id: None,
            target_bearing_deg: None,
            confidence: 0.0,
            reason: "idle".to_string(),
            stability: LockStability::default(),
        }
    }

    /// Plane wave from `bearing` sampled by the square array.
    fn wave_frame(t_ns: u64, seq: u64, bearing: f32, frames: usize) -> AudioFrame {
        let geometry = square_array();
        let mut samples = vec![0.0f32; frames * 4];
        for ch in 0..4 {
            let delay_s = geometry.delay_s(ch, bearing);
            for n in 0..frames {
                let t_s = n as f32 / 16_000.0 + delay_s + t_ns as f32 / 1e9;
                samples[n * 4 + ch] = (2.0 * std::f32::consts::PI * 1000.0 * t_s).sin() * 0.5;
            }
        }
        AudioFrame::new(t_ns, seq, 16_000, 4, samples)
    }

    fn steady_rms(beamformer: &mut DelayAndSumBeamformer, bearing: f32, lock_bearing: f32) -> f32 {
        // First blocks warm the history; measure the last one.
        let mut rms = 0.0;
        for i in 0..4u64 {
            let frame = wave_frame(i * 64_000_000, i + 1, bearing, 1024);
            let lock = lock_at(i * 64_000_000, lock_bearing);
            let (enhanced, _) = beamformer.process(&frame, Some(&lock));
            rms = enhanced.stats.rms;
        }
        rms
    }

    #[test]
    fn test_one_output_block_per_input_aligned_seq() {
        let mut beamformer = beamformer(BeamformConfig::default());
        for seq in 1..=5u64 {
            let frame = wave_frame(seq * 64_000_000, seq, 90.0, 1024);
            let (enhanced, _) = beamformer.process(&frame, None);
            assert_eq!(enhanced.seq, seq);
            assert_eq!(enhanced.t_ns, frame.t_ns);
            assert_eq!(enhanced.block_samples, 1024);
        }
    }

    #[test]
    fn test_on_axis_steering_beats_off_axis() {
        // Source at 90 degrees: steering at it must preserve more energy
        // than steering away.
        let mut on_axis = beamformer(BeamformConfig::default());
        let rms_on = steady_rms(&mut on_axis, 90.0, 90.0);

        let mut off_axis = beamformer(BeamformConfig::default());
        let rms_off = steady_rms(&mut off_axis, 90.0, 200.0);

        assert!(
            rms_on > rms_off,
            "on-axis rms {rms_on} should beat off-axis {rms_off}"
        );
    }

    #[test]
    fn test_omni_is_channel_average() {
        let mut beamformer = beamformer(BeamformConfig::default());
        // Constant distinct values per channel: average is exact.
        let samples: Vec<f32> = (0..256)
            .flat_map(|_| [0.1f32, 0.2, 0.3, 0.4])
            .collect();
        let frame = AudioFrame::new(0, 1, 16_000, 4, samples);
        let (enhanced, _) = beamformer.process(&frame, None);
        assert!(enhanced.samples.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_stale_lock_treated_as_no_lock() {
        let config = BeamformConfig::default();
        let mut beamformer = DelayAndSumBeamformer::new(square_array(), 16_000, config);
        // Lock is 600ms older than the frame (> use_last_lock_ms 500).
        let frame = wave_frame(700_000_000, 1, 90.0, 256);
        let bearing = beamformer.steering_bearing(&frame, Some(&lock_at(100_000_000, 90.0)));
        assert!(bearing.is_none());

        // Fresh lock steers.
        let bearing = beamformer.steering_bearing(&frame, Some(&lock_at(650_000_000, 90.0)));
        assert_eq!(bearing, Some(90.0));

        // NO_LOCK never steers even when fresh.
        let bearing = beamformer.steering_bearing(&frame, Some(&no_lock(700_000_000)));
        assert!(bearing.is_none());
    }

    #[test]
    fn test_hold_last_keeps_steering() {
        let config = BeamformConfig {
            no_lock_behavior: NoLockBehavior::HoldLast,
            ..BeamformConfig::default()
        };
        let mut beamformer = DelayAndSumBeamformer::new(square_array(), 16_000, config);
        let frame = wave_frame(0, 1, 90.0, 1024);
        beamformer.process(&frame, Some(&lock_at(0, 90.0)));
        assert_eq!(beamformer.last_bearing_deg, Some(90.0));

        // Lock gone: hold_last keeps the bearing cached.
        let frame = wave_frame(64_000_000, 2, 90.0, 1024);
        let (enhanced, _) = beamformer.process(&frame, None);
        assert!(enhanced.stats.rms > 0.0);
        assert_eq!(beamformer.last_bearing_deg, Some(90.0));
    }

    #[test]
    fn test_mute_fades_to_zero() {
        let config = BeamformConfig {
            no_lock_behavior: NoLockBehavior::Mute,
            fade_ms: 20,
            ..BeamformConfig::default()
        };
        let mut beamformer = DelayAndSumBeamformer::new(square_array(), 16_000, config);

        let (first, _) = beamformer.process(&wave_frame(0, 1, 90.0, 1024), None);
        // 20ms fade is 320 samples at 16kHz: the block starts nonzero and
        // ends silent, no hard cut.
        assert!(first.samples[..16].iter().any(|&s| s != 0.0));
        assert!(first.samples[512..].iter().all(|&s| s == 0.0));

        let (second, _) = beamformer.process(&wave_frame(64_000_000, 2, 90.0, 1024), None);
        assert!(second.samples.iter().all(|&s| s == 0.0));
        assert_eq!(second.stats.rms, 0.0);
    }

    #[test]
    fn test_mute_recovers_with_fade_in() {
        let config = BeamformConfig {
            no_lock_behavior: NoLockBehavior::Mute,
            fade_ms: 20,
            ..BeamformConfig::default()
        };
        let mut beamformer = DelayAndSumBeamformer::new(square_array(), 16_000, config);
        beamformer.process(&wave_frame(0, 1, 90.0, 1024), None);

        let (enhanced, _) =
            beamformer.process(&wave_frame(64_000_000, 2, 90.0, 1024), Some(&lock_at(64_000_000, 90.0)));
        // Gain ramps back up over the fade window.
        assert!(enhanced.samples[512..].iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_channel_mismatch_degrades_once_then_recovers() {
        let mut beamformer = beamformer(BeamformConfig::default());
        let bad = AudioFrame::new(0, 1, 16_000, 2, vec![0.1; 512]);

        let (enhanced, notice) = beamformer.process(&bad, None);
        assert!(matches!(notice, Some(BeamformNotice::Degraded { .. })));
        assert_eq!(enhanced.block_samples, 256);

        // Second bad frame: no repeat notice.
        let bad = AudioFrame::new(64_000_000, 2, 16_000, 2, vec![0.1; 512]);
        let (_, notice) = beamformer.process(&bad, None);
        assert!(notice.is_none());

        // Matching frame again: recovery notice.
        let (_, notice) = beamformer.process(&wave_frame(128_000_000, 3, 90.0, 256), None);
        assert!(matches!(notice, Some(BeamformNotice::Recovered)));
    }

    #[test]
    fn test_suppression_stats_reasonable() {
        let mut beamformer = beamformer(BeamformConfig::default());
        let (enhanced, _) = beamformer.process(&wave_frame(0, 1, 90.0, 1024), None);
        assert!(enhanced.stats.suppression_db >= -60.0);
        assert!(enhanced.stats.suppression_db <= 60.0);
        assert_eq!(enhanced.stats.clipped_samples, 0);

        // Silence: defined zero suppression.
        let silent = AudioFrame::new(64_000_000, 2, 16_000, 4, vec![0.0; 4096]);
        let (enhanced, _) = beamformer.process(&silent, None);
        assert_eq!(enhanced.stats.suppression_db, 0.0);
        assert_eq!(enhanced.stats.rms, 0.0);
    }

    #[test]
    fn test_deterministic_output() {
        let mut a = beamformer(BeamformConfig::default());
        let mut b = beamformer(BeamformConfig::default());
        for i in 0..3u64 {
            let frame = wave_frame(i * 64_000_000, i + 1, 120.0, 1024);
            let lock = lock_at(i * 64_000_000, 120.0);
            let (out_a, _) = a.process(&frame, Some(&lock));
            let (out_b, _) = b.process(&frame, Some(&lock));
            assert_eq!(out_a.samples, out_b.samples);
        }
    }
}
