//! Silence trimming by trial and error.
//!
//! Silence detection is done by the encoder, which has no notion of what the
//! track should sound like. A threshold that is too loose eats quiet intros
//! and fade-outs, so each encode is checked against the source duration and
//! retried with a stricter threshold until the result is close enough.

use std::time::Duration;

use log::debug;

use crate::error::TranscodeError;

/// Thresholds in dBFS, least to most strict
pub const DEFAULT_THRESHOLDS_DB: [f64; 4] = [-40.0, -50.0, -60.0, -70.0];

pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5);

/// The accepted encode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    /// Threshold that produced the output, `None` for the untrimmed fallback
    pub threshold_db: Option<f64>,
    pub duration: Duration,
    pub attempts: usize,
}

fn within_tolerance(expected: Duration, actual: Duration, tolerance: Duration) -> bool {
    !actual.is_zero() && expected.abs_diff(actual) <= tolerance
}

/// Runs `attempt` with each threshold until the measured duration matches
/// `source_duration` within `tolerance`, then once without silence removal.
///
/// `attempt` encodes with the given threshold and returns the duration of the
/// result. Its errors end the search immediately.
pub fn converge<F>(
    source_duration: Duration,
    thresholds_db: &[f64],
    tolerance: Duration,
    mut attempt: F,
) -> Result<Convergence, TranscodeError>
where
    F: FnMut(Option<f64>) -> Result<Duration, TranscodeError>,
{
    let mut attempts = 0;

    for &threshold in thresholds_db {
        attempts += 1;
        let duration = attempt(Some(threshold))?;
        if within_tolerance(source_duration, duration, tolerance) {
            return Ok(Convergence {
                threshold_db: Some(threshold),
                duration,
                attempts,
            });
        }
        debug!(
            "Threshold {} dB gave {:.2}s for a {:.2}s source, trying the next one",
            threshold,
            duration.as_secs_f64(),
            source_duration.as_secs_f64()
        );
    }

    attempts += 1;
    let duration = attempt(None)?;
    if within_tolerance(source_duration, duration, tolerance) {
        Ok(Convergence {
            threshold_db: None,
            duration,
            attempts,
        })
    } else {
        Err(TranscodeError::DurationMismatch {
            expected: source_duration,
            actual: duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn first_close_enough_threshold_wins() {
        let mut tried = Vec::new();
        let result = converge(secs(180.0), &DEFAULT_THRESHOLDS_DB, DEFAULT_TOLERANCE, |t| {
            tried.push(t);
            Ok(match t {
                Some(t) if t > -55.0 => secs(120.0),
                _ => secs(178.0),
            })
        })
        .unwrap();

        assert_eq!(tried, vec![Some(-40.0), Some(-50.0), Some(-60.0)]);
        assert_eq!(
            result,
            Convergence {
                threshold_db: Some(-60.0),
                duration: secs(178.0),
                attempts: 3,
            }
        );
    }

    #[test]
    fn falls_back_to_untrimmed_encode() {
        let result = converge(secs(60.0), &[-40.0, -50.0], secs(1.0), |t| {
            Ok(if t.is_some() { secs(30.0) } else { secs(60.2) })
        })
        .unwrap();
        assert_eq!(result.threshold_db, None);
        assert_eq!(result.attempts, 3);
    }

    #[test]
    fn fallback_that_still_mismatches_is_an_error() {
        let err = converge(secs(60.0), &[-40.0], secs(1.0), |_| Ok(secs(10.0))).unwrap_err();
        assert!(matches!(
            err,
            TranscodeError::DurationMismatch { expected, actual }
                if expected == secs(60.0) && actual == secs(10.0)
        ));
    }

    #[test]
    fn empty_output_never_converges() {
        let result = converge(secs(2.0), &[-40.0], secs(5.0), |t| {
            Ok(if t.is_some() { Duration::ZERO } else { secs(2.0) })
        })
        .unwrap();
        assert_eq!(result.threshold_db, None);
    }

    #[test]
    fn encoder_failure_stops_the_search() {
        let mut calls = 0;
        let err = converge(secs(60.0), &DEFAULT_THRESHOLDS_DB, DEFAULT_TOLERANCE, |_| {
            calls += 1;
            Err(TranscodeError::Failed {
                code: 1,
                stderr: "boom".to_string(),
            })
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, TranscodeError::Failed { code: 1, .. }));
    }

    #[test]
    fn no_thresholds_means_a_single_plain_encode() {
        let result = converge(secs(10.0), &[], DEFAULT_TOLERANCE, |t| {
            assert_eq!(t, None);
            Ok(secs(10.0))
        })
        .unwrap();
        assert_eq!(result.attempts, 1);
    }
}
