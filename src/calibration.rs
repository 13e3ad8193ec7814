//! Linear calibration of raw sensor readings.
//!
//! A reading is corrected as `y = slope * x + intercept`. The transform is
//! stateless: parameters travel with every call, and absent parameters mean
//! identity for that call. Nothing is remembered between calls.

use serde::{Deserialize, Serialize};

/// Slope / intercept pair for one calibration call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub slope: f64,
    pub intercept: f64,
}

impl CalibrationParams {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    /// `y = x`.
    pub fn identity() -> Self {
        Self { slope: 1.0, intercept: 0.0 }
    }

    pub fn is_identity(&self) -> bool {
        self.slope == 1.0 && self.intercept == 0.0
    }
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self::identity()
    }
}

/// Applies the linear correction to one raw reading.
pub fn calibrate(raw: f64, params: &CalibrationParams) -> f64 {
    params.slope * raw + params.intercept
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identity_passthrough() {
        assert_eq!(calibrate(21.5, &CalibrationParams::identity()), 21.5);
        assert_eq!(calibrate(-3.0, &CalibrationParams::default()), -3.0);
    }

    #[test]
    fn test_linear_transform() {
        let params = CalibrationParams::new(2.0, 1.0);
        assert_eq!(calibrate(20.0, &params), 41.0);
        assert_eq!(calibrate(25.0, &params), 51.0);
        assert_eq!(calibrate(30.0, &params), 61.0);
    }

    #[test]
    fn test_no_state_between_calls() {
        let scaled = CalibrationParams::new(3.0, -2.0);
        calibrate(10.0, &scaled);
        // A later call with defaults is unaffected by the earlier parameters.
        assert_eq!(calibrate(10.0, &CalibrationParams::default()), 10.0);
    }

    proptest! {
        #[test]
        fn prop_identity_law(x in -1e9f64..1e9) {
            prop_assert_eq!(calibrate(x, &CalibrationParams::identity()), x);
        }

        #[test]
        fn prop_matches_direct_formula(
            x in -1e6f64..1e6,
            m in -1e3f64..1e3,
            c in -1e3f64..1e3,
        ) {
            let params = CalibrationParams::new(m, c);
            prop_assert_eq!(calibrate(x, &params), m * x + c);
        }
    }
}
