//! Value ranges swept by a parameter.

use serde::{Deserialize, Serialize};

/// Largest number of points of a range, and of a whole scan.
pub const MAX_POINTS: usize = 1_000_000;

/// Evenly (or geometrically, when `log` is set) spaced values from `start`
/// to `end`, both included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanRange {
    /// First value
    pub start: f64,
    /// Last value
    pub end: f64,
    /// Number of values, bounds included
    pub nbpts: usize,
    /// Geometric spacing
    pub log: bool,
}

impl Default for ScanRange {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 10.0,
            nbpts: 11,
            log: false,
        }
    }
}

impl ScanRange {
    /// Evenly spaced range.
    pub fn linear(start: f64, end: f64, nbpts: usize) -> Self {
        Self {
            start,
            end,
            nbpts,
            log: false,
        }
    }

    /// Geometrically spaced range; both bounds must be positive.
    pub fn log(start: f64, end: f64, nbpts: usize) -> Self {
        Self {
            start,
            end,
            nbpts,
            log: true,
        }
    }

    /// Checks the point count and the bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.nbpts == 0 {
            return Err("a range needs at least one point".to_string());
        }
        if self.nbpts > MAX_POINTS {
            return Err(format!(
                "a range holds at most {MAX_POINTS} points, got {}",
                self.nbpts
            ));
        }
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(format!(
                "range bounds must be finite, got {} to {}",
                self.start, self.end
            ));
        }
        if self.log && (self.start <= 0.0 || self.end <= 0.0) {
            return Err(format!(
                "log range bounds must be positive, got {} to {}",
                self.start, self.end
            ));
        }
        Ok(())
    }

    /// Distance between the two bounds.
    pub fn width(&self) -> f64 {
        (self.end - self.start).abs()
    }

    /// Linear distance between consecutive points; 0 for a single point.
    pub fn step(&self) -> f64 {
        if self.nbpts <= 1 {
            0.0
        } else {
            self.width() / (self.nbpts - 1) as f64
        }
    }

    /// Number of points such that consecutive points are about `step` apart.
    ///
    /// A zero step collapses the range to its start.
    pub fn with_step(mut self, step: f64) -> Result<Self, String> {
        if !step.is_finite() || step < 0.0 {
            return Err(format!("step must be a positive number, got {step}"));
        }
        if step == 0.0 {
            self.nbpts = 1;
            return Ok(self);
        }
        let intervals = (self.width() / step).round();
        if !intervals.is_finite() || intervals >= MAX_POINTS as f64 {
            return Err(format!(
                "step {step} over a width of {} needs more than {MAX_POINTS} points",
                self.width()
            ));
        }
        self.nbpts = intervals as usize + 1;
        Ok(self)
    }

    /// The values of the range, start first.
    pub fn values(&self) -> Result<Vec<f64>, String> {
        self.validate()?;
        if self.nbpts == 1 {
            return Ok(vec![self.start]);
        }

        let last = self.nbpts - 1;
        let values = if self.log {
            let (a, b) = (self.start.log10(), self.end.log10());
            (0..self.nbpts)
                .map(|i| match i {
                    0 => self.start,
                    i if i == last => self.end,
                    i => 10f64.powf(a + (b - a) * i as f64 / last as f64),
                })
                .collect()
        } else {
            (0..self.nbpts)
                .map(|i| match i {
                    0 => self.start,
                    i if i == last => self.end,
                    i => self.start + (self.end - self.start) * i as f64 / last as f64,
                })
                .collect()
        };
        Ok(values)
    }
}
