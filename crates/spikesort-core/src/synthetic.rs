//! Seeded synthetic recordings for demos and tests.

use crate::recording::{InMemoryRecording, Result};
use crate::sorting::SortingResult;
use crate::types::{ChannelId, GROUP_PROPERTY, LOCATION_PROPERTY};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const TOY_SAMPLING_FREQUENCY: f64 = 30_000.0;

const NOISE_STD: f64 = 10.0;
const SPIKE_AMPLITUDE: f64 = 150.0;
const FIRING_RATE_HZ: f64 = 5.0;
const WAVEFORM_LEN: usize = 60;
const TROUGH_AT: usize = 20;
/// Channels per electrode group.
const GROUP_SIZE: usize = 2;
/// Vertical spacing between channels, in micrometres.
const PITCH_UM: f64 = 25.0;

/// Gaussian noise plus negative-going spikes injected on every channel.
///
/// Each channel fires independently at a fixed rate with at least one
/// waveform length between spikes. Channels carry a `group` property
/// (pairs of channels) and a 2-D `location`. The returned sorting holds the
/// injected trough times, one unit per channel, unit id equal to channel id.
pub fn toy_recording(
    num_channels: usize,
    duration_s: f64,
    seed: u64,
) -> Result<(InMemoryRecording, SortingResult)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let num_frames = (duration_s * TOY_SAMPLING_FREQUENCY).round() as usize;
    let waveform = waveform();

    let mut traces = Vec::with_capacity(num_channels);
    let mut truth = SortingResult::new(Some(TOY_SAMPLING_FREQUENCY));
    for channel in 0..num_channels {
        let mut trace: Vec<f32> = (0..num_frames)
            .map(|_| (gaussian(&mut rng) * NOISE_STD) as f32)
            .collect();

        let mut spikes = Vec::new();
        let mean_gap = TOY_SAMPLING_FREQUENCY / FIRING_RATE_HZ;
        let mut at = WAVEFORM_LEN + rng.random_range(0..WAVEFORM_LEN);
        while at + WAVEFORM_LEN < num_frames {
            for (offset, sample) in waveform.iter().enumerate() {
                trace[at + offset] += *sample;
            }
            spikes.push((at + TROUGH_AT) as u64);
            let gap = -mean_gap * (1.0 - rng.random::<f64>()).ln();
            at += WAVEFORM_LEN * 2 + gap as usize;
        }

        traces.push(trace);
        truth.add_unit(channel as ChannelId, spikes);
    }

    let mut recording = InMemoryRecording::new(TOY_SAMPLING_FREQUENCY, traces)?;
    for channel in 0..num_channels {
        let id = channel as ChannelId;
        recording.set_channel_property(id, GROUP_PROPERTY, (channel / GROUP_SIZE) as i64)?;
        recording.set_channel_property(id, LOCATION_PROPERTY, vec![0.0, channel as f64 * PITCH_UM])?;
    }
    Ok((recording, truth))
}

/// Trough followed by a slower positive rebound.
fn waveform() -> Vec<f32> {
    (0..WAVEFORM_LEN)
        .map(|i| {
            let t = i as f64;
            let trough = -SPIKE_AMPLITUDE * (-((t - TROUGH_AT as f64) / 3.0).powi(2)).exp();
            let rebound = 0.3 * SPIKE_AMPLITUDE * (-((t - 35.0) / 8.0).powi(2)).exp();
            (trough + rebound) as f32
        })
        .collect()
}

/// Standard normal sample (Box-Muller).
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
