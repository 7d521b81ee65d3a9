use std::f64::consts::PI;

use log::{debug, trace};
use rand::Rng;

use telemetry_types::{Axis, SampleBatch, StreamKind, SubChannel};

/// What the simulated device streams, derived from the last sensing writes.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalPlan {
    pub frame_ms: u16,
    /// Enabled time-domain channel indices and their shared rate.
    pub td_channels: Vec<u8>,
    pub td_rate_hz: Option<u32>,
    /// Enabled power bands, as band indices (channel * 2 + band).
    pub power_bands: Vec<u8>,
    pub accel_rate_hz: Option<u32>,
}

/// Number of samples delivered in one frame. Real framing is approximate,
/// so a frame of nominally 50 samples sometimes carries 48 to 52.
pub fn samples_per_frame(rate_hz: u32, frame_ms: u16, jitter: bool) -> usize {
    let nominal = (rate_hz as usize * frame_ms as usize) / 1000;
    if !jitter || nominal < 8 {
        return nominal.max(1);
    }
    let delta: i64 = rand::thread_rng().gen_range(-2..=2);
    (nominal as i64 + delta).max(1) as usize
}

/// Produces local-field-potential-like voltages with several oscillatory
/// components and line noise.
#[derive(Debug, Clone)]
pub struct LfpGenerator {
    sample_rate: u32,
    phases: Vec<[f64; 5]>,
    line_noise_amplitude: Vec<f64>,
}

// delta, theta, alpha, beta, line noise
const LFP_FREQS_HZ: [f64; 5] = [2.5, 6.0, 10.0, 20.0, 60.0];
const LFP_WEIGHTS_MV: [f64; 5] = [0.020, 0.012, 0.010, 0.030, 0.004];

impl LfpGenerator {
    pub fn new(sample_rate: u32, num_channels: usize) -> Self {
        let mut rng = rand::thread_rng();
        debug!(
            "Initializing LFP generator with {} Hz sample rate for {} channel(s)",
            sample_rate, num_channels
        );

        let phases = (0..num_channels)
            .map(|_| {
                let mut p = [0.0; 5];
                for phase in p.iter_mut() {
                    *phase = rng.gen::<f64>() * 2.0 * PI;
                }
                p
            })
            .collect();
        let line_noise_amplitude = (0..num_channels).map(|_| rng.gen_range(0.001..0.004)).collect();

        Self {
            sample_rate,
            phases,
            line_noise_amplitude,
        }
    }

    pub fn next_sample(&mut self, channel: usize) -> f64 {
        let mut rng = rand::thread_rng();
        let mut signal = 0.0;
        for (i, phase) in self.phases[channel].iter_mut().enumerate() {
            *phase += 2.0 * PI * LFP_FREQS_HZ[i] / self.sample_rate as f64;
            if *phase > 2.0 * PI {
                *phase -= 2.0 * PI;
            }
            let weight = if i == 4 {
                self.line_noise_amplitude[channel]
            } else {
                LFP_WEIGHTS_MV[i]
            };
            signal += phase.sin() * weight;
        }
        signal + (rng.gen::<f64>() - 0.5) * 0.004
    }
}

/// Generates one frame worth of batches for every stream in the plan.
pub struct SignalGenerator {
    plan: SignalPlan,
    lfp: Option<LfpGenerator>,
    accel_t: f64,
    sequences: [u64; 3],
}

impl SignalGenerator {
    pub fn new(plan: SignalPlan) -> Self {
        let lfp = plan
            .td_rate_hz
            .map(|rate| LfpGenerator::new(rate, plan.td_channels.len()));
        Self {
            plan,
            lfp,
            accel_t: 0.0,
            sequences: [0; 3],
        }
    }

    fn next_sequence(&mut self, kind: StreamKind) -> u64 {
        let slot = match kind {
            StreamKind::TimeDomain => 0,
            StreamKind::Power => 1,
            StreamKind::Accelerometer => 2,
        };
        let seq = self.sequences[slot];
        self.sequences[slot] += 1;
        seq
    }

    pub fn time_domain_frame(&mut self) -> Option<SampleBatch> {
        let rate = self.plan.td_rate_hz?;
        let n = samples_per_frame(rate, self.plan.frame_ms, true);
        let channels = self.plan.td_channels.clone();
        let seq = self.next_sequence(StreamKind::TimeDomain);
        let lfp = self.lfp.as_mut()?;

        let mut batch = SampleBatch::new(StreamKind::TimeDomain, seq);
        for (slot, &channel) in channels.iter().enumerate() {
            let samples = (0..n).map(|_| lfp.next_sample(slot)).collect();
            batch = batch.with_channel(SubChannel::Index(channel), samples);
        }
        trace!("Generated TD frame {} with {} samples per channel", seq, n);
        Some(batch)
    }

    pub fn power_frame(&mut self) -> Option<SampleBatch> {
        if self.plan.power_bands.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        let seq = self.next_sequence(StreamKind::Power);
        let mut batch = SampleBatch::new(StreamKind::Power, seq);
        for &band in &self.plan.power_bands {
            let base = 1200.0 / (1.0 + band as f64);
            batch = batch.with_channel(SubChannel::Index(band), vec![base * rng.gen_range(0.8..1.2)]);
        }
        Some(batch)
    }

    pub fn accel_frame(&mut self) -> Option<SampleBatch> {
        let rate = self.plan.accel_rate_hz?;
        let n = samples_per_frame(rate, self.plan.frame_ms, false);
        let mut rng = rand::thread_rng();
        let seq = self.next_sequence(StreamKind::Accelerometer);

        let mut xs = Vec::with_capacity(n);
        let mut ys = Vec::with_capacity(n);
        let mut zs = Vec::with_capacity(n);
        for _ in 0..n {
            self.accel_t += 1.0 / rate as f64;
            // slow sway around a resting posture, in g
            let sway = (2.0 * PI * 0.3 * self.accel_t).sin() * 0.05;
            xs.push(sway + (rng.gen::<f64>() - 0.5) * 0.01);
            ys.push(-sway * 0.5 + (rng.gen::<f64>() - 0.5) * 0.01);
            zs.push(1.0 + (rng.gen::<f64>() - 0.5) * 0.01);
        }
        Some(
            SampleBatch::new(StreamKind::Accelerometer, seq)
                .with_channel(SubChannel::Axis(Axis::X), xs)
                .with_channel(SubChannel::Axis(Axis::Y), ys)
                .with_channel(SubChannel::Axis(Axis::Z), zs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> SignalPlan {
        SignalPlan {
            frame_ms: 100,
            td_channels: vec![0, 1],
            td_rate_hz: Some(500),
            power_bands: vec![0, 1, 3],
            accel_rate_hz: Some(32),
        }
    }

    #[test]
    fn frame_size_stays_near_nominal() {
        for _ in 0..100 {
            let n = samples_per_frame(1000, 50, true);
            assert!((48..=52).contains(&n), "got {}", n);
        }
        assert_eq!(samples_per_frame(32, 100, true), 3);
    }

    #[test]
    fn time_domain_frame_covers_enabled_channels() {
        let mut gen = SignalGenerator::new(plan());
        let batch = gen.time_domain_frame().unwrap();
        assert_eq!(batch.sequence, 0);
        assert!(batch.samples(SubChannel::Index(0)).is_some());
        assert!(batch.samples(SubChannel::Index(1)).is_some());
        assert!(batch.samples(SubChannel::Index(2)).is_none());
        assert_eq!(gen.time_domain_frame().unwrap().sequence, 1);
    }

    #[test]
    fn disabled_streams_produce_nothing() {
        let mut gen = SignalGenerator::new(SignalPlan {
            td_rate_hz: None,
            power_bands: vec![],
            accel_rate_hz: None,
            ..plan()
        });
        assert!(gen.time_domain_frame().is_none());
        assert!(gen.power_frame().is_none());
        assert!(gen.accel_frame().is_none());
    }

    #[test]
    fn accel_frame_has_three_axes() {
        let mut gen = SignalGenerator::new(plan());
        let batch = gen.accel_frame().unwrap();
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            assert_eq!(batch.samples(SubChannel::Axis(axis)).unwrap().len(), 3);
        }
    }
}
