//! Scale curves
//!
//! A scale curve maps sampling progress to the factor applied to a feature
//! map's spatial size. [`SigmaScaleResolver`] turns a curve into a function of
//! the noise level using a model's sampling schedule.

use tracing::debug;

use crate::schedule::{SamplingSchedule, SigmaSamples};

/// Scale factor as a function of sampling progress.
pub trait ScaleCurve: Send + Sync {
    fn scale_at(&self, percent: f64) -> f64;
}

/// Linear ramp from `1 / downscale_factor` at `start_percent` to `1.0` at
/// `end_percent`, held constant outside that window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearRamp {
    pub start_percent: f64,
    pub end_percent: f64,
    pub downscale_factor: f64,
}

impl LinearRamp {
    pub fn new(start_percent: f64, end_percent: f64, downscale_factor: f64) -> Self {
        Self {
            start_percent,
            end_percent,
            downscale_factor,
        }
    }
}

impl ScaleCurve for LinearRamp {
    fn scale_at(&self, percent: f64) -> f64 {
        let low = 1.0 / self.downscale_factor;
        if percent < self.start_percent {
            return low;
        }
        // `>=` keeps the end value exact and covers start == end.
        if percent >= self.end_percent {
            return 1.0;
        }
        let t = (percent - self.start_percent) / (self.end_percent - self.start_percent);
        low + (1.0 - low) * t
    }
}

/// Curve through `(percent, scale)` points, either linearly interpolated or
/// held until the next point.
///
/// Below the first point the curve is anchored at `(0.0, 0.0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseCurve {
    points: Vec<(f64, f64)>,
    interpolate: bool,
}

impl PiecewiseCurve {
    /// Points are sorted by percent (then scale); duplicates are kept.
    pub fn new(mut points: Vec<(f64, f64)>, interpolate: bool) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
        Self {
            points,
            interpolate,
        }
    }

    /// Parse one `"<percent> <scale>"` pair per line.
    ///
    /// Surrounding whitespace of the whole text is ignored, every remaining
    /// line must hold exactly two numbers.
    pub fn parse(text: &str, interpolate: bool) -> Result<Self, CurveParseError> {
        let mut points = Vec::new();
        for (idx, line) in text.trim().split('\n').enumerate() {
            let line_no = idx + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [percent, scale] = fields[..] else {
                return Err(CurveParseError::WrongFieldCount {
                    line: line_no,
                    found: fields.len(),
                });
            };
            points.push((parse_number(line_no, percent)?, parse_number(line_no, scale)?));
        }

        let curve = Self::new(points, interpolate);
        for (percent, scale) in &curve.points {
            debug!(percent, scale, "deep shrink curve point");
        }
        Ok(curve)
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn interpolate(&self) -> bool {
        self.interpolate
    }
}

fn parse_number(line: usize, value: &str) -> Result<f64, CurveParseError> {
    value
        .parse::<f64>()
        .map_err(|source| CurveParseError::InvalidNumber {
            line,
            value: value.to_string(),
            source,
        })
}

fn lerp(percent: f64, lower: (f64, f64), upper: (f64, f64)) -> f64 {
    let (lower_percent, lower_scale) = lower;
    let (upper_percent, upper_scale) = upper;
    if upper_percent == lower_percent {
        return lower_scale;
    }
    lower_scale
        + (upper_scale - lower_scale) * ((percent - lower_percent) / (upper_percent - lower_percent))
}

impl ScaleCurve for PiecewiseCurve {
    fn scale_at(&self, percent: f64) -> f64 {
        let mut lower = (0.0, 0.0);
        for &(p, scale) in &self.points {
            if percent == p {
                return scale;
            }
            if percent < p {
                if self.interpolate && lower.0 != p {
                    return lerp(percent, lower, (p, scale));
                }
                return lower.1;
            }
            lower = (p, scale);
        }
        lower.1
    }
}

impl<C: ScaleCurve + ?Sized> ScaleCurve for std::sync::Arc<C> {
    fn scale_at(&self, percent: f64) -> f64 {
        (**self).scale_at(percent)
    }
}

/// Scale factor as a function of the current sigma.
#[derive(Debug, Clone)]
pub struct SigmaScaleResolver<C> {
    curve: C,
    samples: SigmaSamples,
}

impl<C: ScaleCurve> SigmaScaleResolver<C> {
    pub fn new(curve: C, schedule: &dyn SamplingSchedule) -> Self {
        Self {
            curve,
            samples: SigmaSamples::new(schedule),
        }
    }

    pub fn curve(&self) -> &C {
        &self.curve
    }

    pub fn samples(&self) -> &SigmaSamples {
        &self.samples
    }

    /// Scale at the latest sampled percent the schedule has not reached yet,
    /// or `1.0` if every sampled sigma is at or below `sigma`.
    pub fn resolve(&self, sigma: f64) -> f64 {
        self.samples
            .last_percent_above(sigma)
            .map_or(1.0, |percent| self.curve.scale_at(percent))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CurveParseError {
    #[error("line {line}: expected `<percent> <scale>`, found {found} field(s)")]
    WrongFieldCount { line: usize, found: usize },

    #[error("line {line}: invalid number {value:?}")]
    InvalidNumber {
        line: usize,
        value: String,
        #[source]
        source: std::num::ParseFloatError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::FnSchedule;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_ramp_holds_outside_window() {
        let ramp = LinearRamp::new(0.2, 0.6, 4.0);
        for percent in [0.0, 0.1, 0.19, 0.2] {
            assert_eq!(ramp.scale_at(percent), 0.25, "percent {percent}");
        }
        for percent in [0.6, 0.61, 0.9, 1.0] {
            assert_eq!(ramp.scale_at(percent), 1.0, "percent {percent}");
        }
    }

    #[test]
    fn test_ramp_is_increasing_inside_window() {
        let ramp = LinearRamp::new(0.1, 0.5, 2.0);
        let values: Vec<f64> = (11..50).map(|i| ramp.scale_at(i as f64 / 100.0)).collect();
        for w in values.windows(2) {
            assert!(w[1] > w[0]);
        }
        assert!(close(ramp.scale_at(0.3), 0.75));
        // continuous at both ends
        assert!((ramp.scale_at(0.1 + 1e-9) - 0.5).abs() < 1e-6);
        assert!((ramp.scale_at(0.5 - 1e-9) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ramp_upscale_factor_decreases() {
        let ramp = LinearRamp::new(0.0, 1.0, 0.5);
        assert_eq!(ramp.scale_at(0.0), 2.0);
        assert!(ramp.scale_at(0.25) > ramp.scale_at(0.5));
        assert_eq!(ramp.scale_at(1.0), 1.0);
    }

    #[test]
    fn test_degenerate_ramp() {
        let ramp = LinearRamp::new(0.3, 0.3, 2.0);
        assert_eq!(ramp.scale_at(0.29), 0.5);
        assert_eq!(ramp.scale_at(0.3), 1.0);
        assert_eq!(ramp.scale_at(0.31), 1.0);
    }

    #[test]
    fn test_parse_sorts_points() {
        let curve = PiecewiseCurve::parse("  1 1\n0 0.5\n0.5   0.7  \n", true).unwrap();
        assert_eq!(curve.points(), &[(0.0, 0.5), (0.5, 0.7), (1.0, 1.0)]);
        assert!(curve.interpolate());
    }

    #[test]
    fn test_parse_accepts_duplicates() {
        let curve = PiecewiseCurve::parse("0.5 2\n0.5 1", false).unwrap();
        assert_eq!(curve.points(), &[(0.5, 1.0), (0.5, 2.0)]);
    }

    #[test]
    fn test_parse_errors() {
        let err = PiecewiseCurve::parse("0 0.5\n1", true).unwrap_err();
        assert!(matches!(err, CurveParseError::WrongFieldCount { line: 2, found: 1 }));

        let err = PiecewiseCurve::parse("0 0.5 7", true).unwrap_err();
        assert!(matches!(err, CurveParseError::WrongFieldCount { line: 1, found: 3 }));

        let err = PiecewiseCurve::parse("0 half", true).unwrap_err();
        assert!(matches!(err, CurveParseError::InvalidNumber { line: 1, .. }));
        assert!(err.to_string().contains("\"half\""));

        let err = PiecewiseCurve::parse("0 0.5\n\n1 1", true).unwrap_err();
        assert!(matches!(err, CurveParseError::WrongFieldCount { line: 2, found: 0 }));

        let err = PiecewiseCurve::parse("   \n ", true).unwrap_err();
        assert!(matches!(err, CurveParseError::WrongFieldCount { line: 1, found: 0 }));
    }

    #[test]
    fn test_interpolated_midpoint() {
        let curve = PiecewiseCurve::parse("0 0.5\n1 1", true).unwrap();
        assert!(close(curve.scale_at(0.5), 0.75));
        assert_eq!(curve.scale_at(0.0), 0.5);
        assert_eq!(curve.scale_at(1.0), 1.0);
        // past the last point
        assert_eq!(curve.scale_at(1.5), 1.0);
    }

    #[test]
    fn test_step_curve_holds_lower_point() {
        let curve = PiecewiseCurve::parse("0 0.5\n0.3 0.8\n0.6 1", false).unwrap();
        assert_eq!(curve.scale_at(0.0), 0.5);
        assert_eq!(curve.scale_at(0.29), 0.5);
        assert_eq!(curve.scale_at(0.3), 0.8);
        assert_eq!(curve.scale_at(0.59), 0.8);
        assert_eq!(curve.scale_at(0.6), 1.0);
        assert_eq!(curve.scale_at(0.99), 1.0);
    }

    #[test]
    fn test_implicit_zero_anchor() {
        let stepped = PiecewiseCurve::new(vec![(0.4, 1.0)], false);
        assert_eq!(stepped.scale_at(0.2), 0.0);

        let interpolated = PiecewiseCurve::new(vec![(0.4, 1.0)], true);
        assert!(close(interpolated.scale_at(0.2), 0.5));
    }

    #[test]
    fn test_duplicate_percent_without_interpolation_gap() {
        // Query between equal-percent points falls back to the held value.
        let curve = PiecewiseCurve::new(vec![(0.5, 0.5), (0.5, 0.9), (1.0, 1.0)], true);
        assert_eq!(curve.scale_at(0.5), 0.5);
        assert!(close(curve.scale_at(0.75), 0.95));
    }

    #[test]
    fn test_empty_curve_is_zero() {
        let curve = PiecewiseCurve::new(Vec::new(), true);
        for percent in [0.0, 0.5, 1.0] {
            assert_eq!(curve.scale_at(percent), 0.0);
        }
    }

    #[test]
    fn test_points_round_trip() {
        let points = vec![(0.0, 0.4), (0.15, 0.55), (0.4, 0.9), (0.7, 1.2), (1.0, 1.0)];
        for interpolate in [true, false] {
            let curve = PiecewiseCurve::new(points.clone(), interpolate);
            for &(percent, scale) in &points {
                assert_eq!(curve.scale_at(percent), scale);
            }
        }
    }

    #[test]
    fn test_resolver_default_when_sigma_too_high() {
        let schedule = FnSchedule(|p: f64| 1.0 - p);
        let resolver = SigmaScaleResolver::new(LinearRamp::new(0.0, 0.35, 2.0), &schedule);
        assert_eq!(resolver.resolve(1.0), 1.0);
        assert_eq!(resolver.resolve(5.0), 1.0);
    }

    #[test]
    fn test_resolver_example() {
        let schedule = FnSchedule(|p: f64| 1.0 - p);
        let resolver = SigmaScaleResolver::new(LinearRamp::new(0.0, 0.35, 2.0), &schedule);
        let expected = 0.5 + 0.5 * (0.19 / 0.35);
        assert!(close(resolver.resolve(0.8), expected));
        assert!((resolver.resolve(0.8) - 0.7714).abs() < 1e-4);
    }
}
