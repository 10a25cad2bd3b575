//! Spike detection and interpolation for CTG signal streams.
//!
//! CTG traces carry frequent single-sample artefacts (electrode dropouts,
//! motion). A plain threshold rejector would flatten genuine decelerations,
//! so the filter only replaces values that are isolated *and* sit inside a
//! stable context. Classification runs one sample behind the stream head:
//! every verdict describes the previous sample, judged with the newest one
//! as right-context.

use crate::sample::{SignalKind, SIGNAL_LOSS};

/// Window capacity per (device, kind) stream.
const WINDOW_CAPACITY: usize = 20;
/// Minimum window fill before any classification happens.
const MIN_SAMPLES: usize = 7;
/// Context values gathered on each side of the examined sample.
const CONTEXT_WINDOW: usize = 3;
/// Absolute deviation from the context mean that marks a spike candidate.
const SPIKE_DEVIATION: f64 = 8.0;

/// Physiological limits. Anything outside collapses to [`SIGNAL_LOSS`].
const FHR_RANGE: (f64, f64) = (50.0, 220.0);
const UC_RANGE: (f64, f64) = (-5.0, 150.0);

/// A value is acceptable when it is the signal-loss sentinel or inside the
/// physiological range for its kind.
pub fn is_valid_value(kind: SignalKind, value: f64) -> bool {
    if value == SIGNAL_LOSS {
        return true;
    }
    if value.is_nan() || value.is_infinite() {
        return false;
    }
    let (lo, hi) = match kind {
        SignalKind::FetalHeartRate => FHR_RANGE,
        SignalKind::UterineContractions => UC_RANGE,
    };
    (lo..=hi).contains(&value)
}

/// Verdict about the sample one position behind the newest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Pass,
    /// The examined sample is an isolated artefact; replace it with the
    /// interpolated value.
    Spike(f64),
}

/// Sliding window of recent in-range values for one (device, kind) stream.
#[derive(Debug, Default)]
pub struct SpikeFilter {
    window: Vec<f64>,
}

impl SpikeFilter {
    pub fn new() -> Self {
        Self {
            window: Vec::with_capacity(WINDOW_CAPACITY),
        }
    }

    /// Push a new in-range value and classify the sample before it.
    ///
    /// Returns [`Verdict::Pass`] until the window holds [`MIN_SAMPLES`]
    /// values or when the context on either side is too thin.
    pub fn classify(&mut self, value: f64) -> Verdict {
        self.window.push(value);
        if self.window.len() > WINDOW_CAPACITY {
            self.window.remove(0);
        }
        if self.window.len() < MIN_SAMPLES {
            return Verdict::Pass;
        }

        // Examine the sample just before the newest one.
        let idx = self.window.len() - 2;
        let x = self.window[idx];

        let before = &self.window[idx.saturating_sub(CONTEXT_WINDOW)..idx];
        let after_end = (idx + 1 + CONTEXT_WINDOW).min(self.window.len());
        let after = &self.window[idx + 1..after_end];

        // The one-sample delay means `after` holds at most one value; two
        // values of left context are still required.
        if before.len() < 2 || after.is_empty() {
            return Verdict::Pass;
        }

        let mean_before = mean(before);
        let mean_after = mean(after);
        let context_mean = (mean_before + mean_after) / 2.0;
        let context_std = stddev(before.iter().chain(after.iter()), context_mean);
        let deviation = (x - context_mean).abs();

        let deviant = deviation > SPIKE_DEVIATION;
        let context_stable = (mean_before - mean_after).abs() < SPIKE_DEVIATION / 2.0;
        let significant = context_std == 0.0 || deviation / context_std > 2.0;
        let isolated = {
            let last_before = before[before.len() - 1];
            let first_after = after[0];
            (last_before - context_mean).abs() < deviation / 2.0
                && (first_after - context_mean).abs() < deviation / 2.0
        };

        if deviant && context_stable && significant && isolated {
            Verdict::Spike(self.interpolate(idx))
        } else {
            Verdict::Pass
        }
    }

    /// Linear interpolation across the spike position, nudged by the local
    /// trend when both outer neighbours are present.
    fn interpolate(&self, idx: usize) -> f64 {
        let before = self.window[idx - 1];
        let after = self.window[idx + 1];
        let mut value = (before + after) / 2.0;

        if idx >= 2 && idx + 2 < self.window.len() {
            let trend_before = self.window[idx - 1] - self.window[idx - 2];
            let trend_after = self.window[idx + 2] - self.window[idx + 1];
            value += 0.1 * ((trend_before + trend_after) / 2.0);
        }

        value
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn stddev<'a>(values: impl Iterator<Item = &'a f64>, mean: f64) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        let d = v - mean;
        sum += d * d;
        count += 1;
    }
    if count <= 1 {
        return 0.0;
    }
    (sum / (count - 1) as f64).sqrt()
}

/// What [`SignalPipeline::push`] decided about an emitted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Emitted {
    Passed,
    /// Sentinel: signal loss on the wire or an out-of-range value collapsed
    /// to [`SIGNAL_LOSS`].
    SignalLoss,
    Interpolated,
}

/// Per-(device, kind) processing state: the range gate, the spike window,
/// and the one-sample holdback that gives every verdict right-context.
///
/// Sentinels and out-of-range values bypass the window entirely; they
/// release any parked sample first so per-kind emission order is preserved.
#[derive(Debug)]
pub struct SignalPipeline {
    kind: SignalKind,
    filter: SpikeFilter,
    pending: Option<(f64, f64)>,
}

impl SignalPipeline {
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            filter: SpikeFilter::new(),
            pending: None,
        }
    }

    /// Feed one sample; returns the samples released for emission, oldest
    /// first, as `(time_sec, value, disposition)`.
    pub fn push(&mut self, time_sec: f64, value: f64) -> Vec<(f64, f64, Emitted)> {
        let mut out = Vec::with_capacity(2);

        if value == SIGNAL_LOSS || !is_valid_value(self.kind, value) {
            if let Some((t, v)) = self.pending.take() {
                out.push((t, v, Emitted::Passed));
            }
            out.push((time_sec, SIGNAL_LOSS, Emitted::SignalLoss));
            return out;
        }

        let verdict = self.filter.classify(value);
        if let Some((t, v)) = self.pending.take() {
            match verdict {
                Verdict::Spike(repl) if is_valid_value(self.kind, repl) => {
                    out.push((t, repl, Emitted::Interpolated));
                }
                Verdict::Spike(_) => out.push((t, SIGNAL_LOSS, Emitted::SignalLoss)),
                Verdict::Pass => out.push((t, v, Emitted::Passed)),
            }
        }
        self.pending = Some((time_sec, value));

        out
    }

    /// Release the parked sample, if any. Called when the device's session
    /// closes and during shutdown so the last sample is never lost.
    pub fn flush(&mut self) -> Option<(f64, f64)> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STABLE: [f64; 7] = [140.0, 141.0, 140.0, 142.0, 140.0, 141.0, 140.0];

    fn warmed_filter() -> SpikeFilter {
        let mut filter = SpikeFilter::new();
        for v in STABLE {
            assert_eq!(filter.classify(v), Verdict::Pass);
        }
        filter
    }

    #[test]
    fn test_no_verdict_during_warmup() {
        // The first six values never produce a classification, even wild ones.
        let mut filter = SpikeFilter::new();
        for v in [140.0, 300.0, 140.0, 139.0, 141.0, 140.0] {
            assert_eq!(filter.classify(v), Verdict::Pass);
        }
    }

    #[test]
    fn test_isolated_spike_detected_and_interpolated() {
        let mut filter = warmed_filter();
        // The spike itself is judged only once its right-context arrives.
        assert_eq!(filter.classify(300.0), Verdict::Pass);
        match filter.classify(140.0) {
            Verdict::Spike(v) => assert_eq!(v, 140.0),
            other => panic!("expected spike, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_stddev_context_still_significant() {
        let mut filter = SpikeFilter::new();
        for _ in 0..7 {
            filter.classify(140.0);
        }
        filter.classify(160.0);
        assert_eq!(filter.classify(140.0), Verdict::Spike(140.0));
    }

    #[test]
    fn test_step_change_is_not_a_spike() {
        // A genuine deceleration shifts the context mean; the stability test
        // keeps it untouched.
        let mut filter = warmed_filter();
        filter.classify(120.0);
        assert_eq!(filter.classify(120.0), Verdict::Pass);
        assert_eq!(filter.classify(121.0), Verdict::Pass);
    }

    #[test]
    fn test_consecutive_outliers_are_not_isolated() {
        let mut filter = warmed_filter();
        assert_eq!(filter.classify(300.0), Verdict::Pass);
        assert_eq!(filter.classify(295.0), Verdict::Pass);
        assert_eq!(filter.classify(140.0), Verdict::Pass);
    }

    #[test]
    fn test_small_wobble_passes() {
        let mut filter = warmed_filter();
        filter.classify(146.0);
        assert_eq!(filter.classify(140.0), Verdict::Pass);
    }

    #[test]
    fn test_range_limits() {
        assert!(is_valid_value(SignalKind::FetalHeartRate, 50.0));
        assert!(is_valid_value(SignalKind::FetalHeartRate, 220.0));
        assert!(!is_valid_value(SignalKind::FetalHeartRate, 30.0));
        assert!(!is_valid_value(SignalKind::FetalHeartRate, 300.0));
        assert!(is_valid_value(SignalKind::FetalHeartRate, SIGNAL_LOSS));
        assert!(is_valid_value(SignalKind::UterineContractions, -5.0));
        assert!(is_valid_value(SignalKind::UterineContractions, 150.0));
        assert!(!is_valid_value(SignalKind::UterineContractions, -9.0));
        assert!(!is_valid_value(SignalKind::UterineContractions, 155.0));
        assert!(!is_valid_value(SignalKind::FetalHeartRate, f64::NAN));
    }

    #[test]
    fn test_pipeline_holds_back_one_sample() {
        let mut pipeline = SignalPipeline::new(SignalKind::FetalHeartRate);
        assert!(pipeline.push(0.0, 140.0).is_empty());
        let out = pipeline.push(1.0, 141.0);
        assert_eq!(out, vec![(0.0, 140.0, Emitted::Passed)]);
        assert_eq!(pipeline.flush(), Some((1.0, 141.0)));
        assert_eq!(pipeline.flush(), None);
    }

    #[test]
    fn test_pipeline_substitutes_spike_in_order() {
        let mut pipeline = SignalPipeline::new(SignalKind::FetalHeartRate);
        let mut emitted = Vec::new();
        for (i, v) in STABLE.iter().enumerate() {
            emitted.extend(pipeline.push(i as f64, *v));
        }
        emitted.extend(pipeline.push(7.0, 300.0));
        let released = pipeline.push(8.0, 140.0);
        // t=7 comes out corrected, not as 300.
        assert_eq!(released, vec![(7.0, 140.0, Emitted::Interpolated)]);

        emitted.extend(released);
        emitted.extend(pipeline.flush().map(|(t, v)| (t, v, Emitted::Passed)));
        let times: Vec<f64> = emitted.iter().map(|(t, _, _)| *t).collect();
        assert_eq!(times, (0..=8).map(|t| t as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_pipeline_collapses_out_of_range() {
        let mut pipeline = SignalPipeline::new(SignalKind::FetalHeartRate);
        let out = pipeline.push(0.0, 30.0);
        assert_eq!(out, vec![(0.0, SIGNAL_LOSS, Emitted::SignalLoss)]);
    }

    #[test]
    fn test_pipeline_sentinel_releases_pending_first() {
        let mut pipeline = SignalPipeline::new(SignalKind::UterineContractions);
        assert!(pipeline.push(0.0, 20.0).is_empty());
        let out = pipeline.push(1.0, SIGNAL_LOSS);
        assert_eq!(
            out,
            vec![
                (0.0, 20.0, Emitted::Passed),
                (1.0, SIGNAL_LOSS, Emitted::SignalLoss),
            ]
        );
    }
}
