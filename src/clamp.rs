use crate::{invalid_input, ThreadSafeStdError};

/// Bounds predicted values to the valid rating domain.
///
/// The same clamp is applied after every partial-score update during both
/// training and serving, so the two stay numerically consistent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClampingFunction {
    /// Values pass through unchanged.
    Identity,
    /// Values are clipped to the closed interval `[min, max]`.
    Range { min: f64, max: f64 },
}

impl ClampingFunction {
    /// Creates a range clamp, validating that `min <= max` and both bounds
    /// are finite.
    pub fn range(min: f64, max: f64) -> Result<Self, ThreadSafeStdError> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(invalid_input(format!(
                "Invalid clamp range: expected finite min <= max, got [{}, {}].",
                min, max
            )));
        }
        Ok(ClampingFunction::Range { min, max })
    }

    /// Applies the clamp to `value`.
    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            ClampingFunction::Identity => value,
            ClampingFunction::Range { min, max } => value.clamp(min, max),
        }
    }
}
