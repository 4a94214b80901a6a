//! Built-in threshold-crossing detector.
//!
//! One unit per channel. A channel's threshold is
//! `detect_threshold * median(|x|) / 0.6745`; crossings closer than
//! `min_diff_samples` belong to the same event, and each event is aligned to
//! its peak within `n_pad_ms` of the first crossing.

use super::{blocking, execution_error};
use crate::partition::PartitionContext;
use spikesort_core::params::{ParamSpec, ParamsExt};
use spikesort_core::recording::Recording;
use spikesort_core::sorting::{SortingResult, SORTING_FILE};
use spikesort_core::types::CHANNEL_PROPERTY;
use spikesort_core::{Result, SortError};
use std::path::Path;
use tracing::debug;

const NAME: &str = "threshold";

pub(super) fn param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("detect_threshold", 5.0, "Threshold in units of the robust noise level"),
        ParamSpec::new("detect_sign", -1, "-1 for negative peaks, 1 for positive, 0 for both"),
        ParamSpec::new("n_pad_ms", 2.0, "Peak search window around the first crossing (ms)"),
        ParamSpec::new("min_diff_samples", 5, "Crossings closer than this many samples are one event"),
    ]
}

#[derive(Debug, Clone, Copy)]
struct Detection {
    threshold: f64,
    sign: i64,
    pad: usize,
    min_diff: usize,
}

fn median(values: &mut [f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    let (_, upper, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
    let upper = f64::from(*upper);
    if values.len() % 2 == 1 {
        return upper;
    }
    let lower = values[..mid].iter().copied().fold(f32::NEG_INFINITY, f32::max);
    (f64::from(lower) + upper) / 2.0
}

/// Peak frames of one channel trace.
fn detect(trace: &[f32], opts: Detection) -> Vec<u64> {
    let mut magnitudes: Vec<f32> = trace.iter().map(|x| x.abs()).collect();
    let noise = median(&mut magnitudes) / 0.6745;
    let thr = opts.threshold * noise;

    let crosses = |x: f32| {
        let x = f64::from(x);
        match opts.sign {
            s if s < 0 => x < -thr,
            s if s > 0 => x > thr,
            _ => x.abs() > thr,
        }
    };
    let score = |x: f32| match opts.sign {
        s if s < 0 => -x,
        s if s > 0 => x,
        _ => x.abs(),
    };

    let mut peaks = Vec::new();
    let mut last: Option<usize> = None;
    for (i, &x) in trace.iter().enumerate() {
        if !crosses(x) {
            continue;
        }
        let new_event = last.map_or(true, |prev| i - prev > opts.min_diff);
        last = Some(i);
        if !new_event {
            continue;
        }
        let lo = i.saturating_sub(opts.pad);
        let hi = (i + opts.pad + 1).min(trace.len());
        let peak = (lo..hi)
            .max_by(|&a, &b| score(trace[a]).total_cmp(&score(trace[b])).then(b.cmp(&a)))
            .unwrap_or(i);
        peaks.push(peak as u64);
    }
    peaks.sort_unstable();
    peaks.dedup();
    peaks
}

fn sort_recording(recording: &dyn Recording, opts: Detection) -> Result<SortingResult> {
    let mut sorting = SortingResult::new(Some(recording.sampling_frequency()));
    let num_frames = recording.num_frames();
    for channel in recording.channel_ids() {
        let trace = recording
            .traces(&[channel], 0, num_frames)
            .map_err(|e| execution_error(NAME, e))?
            .pop()
            .unwrap_or_default();
        let peaks = detect(&trace, opts);
        debug!(channel, spikes = peaks.len(), "threshold detection");
        sorting.add_unit(channel, peaks);
        sorting.set_unit_property(channel, CHANNEL_PROPERTY, channel);
    }
    Ok(sorting)
}

pub(super) async fn run(ctx: &PartitionContext) -> Result<()> {
    let sf = ctx.recording.sampling_frequency();
    let opts = Detection {
        threshold: ctx.params.f64_param("detect_threshold")?,
        sign: ctx.params.i64_param("detect_sign")?,
        pad: (ctx.params.f64_param("n_pad_ms")? * sf / 1000.0).round().max(0.0) as usize,
        min_diff: usize::try_from(ctx.params.i64_param("min_diff_samples")?.max(0)).unwrap_or(0),
    };
    let recording = std::sync::Arc::clone(&ctx.recording);
    let path = ctx.folder.join(SORTING_FILE);
    blocking(NAME, move || {
        let sorting = sort_recording(recording.as_ref(), opts)?;
        sorting.write_json(&path)
    })
    .await
}

pub(super) fn result_from_folder(folder: &Path) -> Result<Option<SortingResult>> {
    let path = folder.join(SORTING_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    SortingResult::read_json(&path)
        .map(Some)
        .map_err(|e| SortError::parsing(NAME, folder, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(sign: i64) -> Detection {
        Detection {
            threshold: 5.0,
            sign,
            pad: 3,
            min_diff: 5,
        }
    }

    fn trace_with(spikes: &[(usize, f32)]) -> Vec<f32> {
        let mut trace: Vec<f32> = (0..200).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        for &(at, value) in spikes {
            trace[at] = value;
        }
        trace
    }

    #[test]
    fn median_of_even_and_odd() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&mut []), 0.0);
    }

    #[test]
    fn negative_peaks_are_aligned_to_trough() {
        let trace = trace_with(&[(50, -20.0), (51, -40.0), (52, -15.0), (120, -30.0)]);
        assert_eq!(detect(&trace, opts(-1)), vec![51, 120]);
    }

    #[test]
    fn sign_selects_polarity() {
        let trace = trace_with(&[(40, 30.0), (100, -30.0)]);
        assert_eq!(detect(&trace, opts(1)), vec![40]);
        assert_eq!(detect(&trace, opts(-1)), vec![100]);
        assert_eq!(detect(&trace, opts(0)), vec![40, 100]);
    }

    #[test]
    fn close_crossings_are_one_event() {
        let trace = trace_with(&[(60, -30.0), (63, -35.0), (90, -30.0)]);
        assert_eq!(detect(&trace, opts(-1)), vec![63, 90]);
    }

    #[test]
    fn one_unit_per_channel() {
        let (rec, truth) = spikesort_core::synthetic::toy_recording(2, 2.0, 7).unwrap();
        let sorting = sort_recording(&rec, opts(-1)).unwrap();
        assert_eq!(sorting.unit_ids(), vec![0, 1]);
        assert_eq!(
            sorting.unit_property(1, CHANNEL_PROPERTY),
            Some(&spikesort_core::types::PropertyValue::Int(1))
        );
        let expected = truth.spike_train(0).unwrap().len();
        let found = sorting.spike_train(0).unwrap().len();
        assert!(found >= expected, "found {found} of {expected} spikes");
    }

    #[test]
    fn missing_output_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(result_from_folder(dir.path()).unwrap().is_none());
        std::fs::write(dir.path().join(SORTING_FILE), "not json").unwrap();
        assert!(matches!(
            result_from_folder(dir.path()),
            Err(SortError::ResultParsing { .. })
        ));
    }
}
