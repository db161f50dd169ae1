//! Fixed-point representation of the floating-point model parameters.
//!
//! The data plane is integer-only, so every floating value crossing the
//! user -> kernel boundary is multiplied by a scale factor and rounded.
//! Means and centroid coordinates use one scaler, standard deviations a
//! second one; values only ever move through a [`FixedScale`] so the two
//! cannot be mixed up.

use serde::Deserialize;

/// How a scale magnitude turns into a multiplication factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMethod {
    /// factor = 10^magnitude
    #[default]
    Exponent,
    /// factor = 1 << magnitude
    Bitshift,
}

pub const DEFAULT_M_SCALE: u32 = 10;
pub const DEFAULT_S_SCALE: u32 = 6;

/// One family of fixed-point values (means or standard deviations).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedScale {
    method: ScaleMethod,
    magnitude: u32,
}

impl FixedScale {
    pub const fn new(method: ScaleMethod, magnitude: u32) -> Self {
        Self { method, magnitude }
    }

    pub fn factor(&self) -> f64 {
        match self.method {
            ScaleMethod::Exponent => 10f64.powi(self.magnitude as i32),
            ScaleMethod::Bitshift => (1u64 << self.magnitude) as f64,
        }
    }

    /// Encode a non-negative quantity (mean, threshold).
    pub fn to_unsigned(&self, value: f64) -> u64 {
        (value * self.factor()).round() as u64
    }

    /// Encode a signed quantity (centroid coordinate, centroid L1 sum).
    pub fn to_signed(&self, value: f64) -> i64 {
        (value * self.factor()).round() as i64
    }

    /// Decode a stored unsigned value back to floating point.
    pub fn recover(&self, raw: u64) -> f64 {
        raw as f64 / self.factor()
    }

    /// The multiplier text the template rewriter splices after each
    /// `$MSCALE(expr)` occurrence.
    pub fn splice_text(&self) -> String {
        match self.method {
            ScaleMethod::Exponent => format!(" * {} ", self.factor() as u64),
            ScaleMethod::Bitshift => format!(" << {} ", self.magnitude),
        }
    }
}

/// The pair of scalers a detector run works with, plus the composite
/// centroid factor used when translating standardized features into the
/// data plane's integer space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub means: FixedScale,
    pub stdevs: FixedScale,
}

impl ScalingPolicy {
    pub fn new(method: ScaleMethod, m_scale: u32, s_scale: u32) -> Self {
        Self {
            means: FixedScale::new(method, m_scale),
            stdevs: FixedScale::new(method, s_scale),
        }
    }

    /// `c_scale = m_scale / s_scale`.
    pub fn centroid_factor(&self) -> f64 {
        self.means.factor() / self.stdevs.factor()
    }
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::new(ScaleMethod::Exponent, DEFAULT_M_SCALE, DEFAULT_S_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponent_factor() {
        let scale = FixedScale::new(ScaleMethod::Exponent, 3);
        assert_eq!(scale.factor(), 1000.0);
        assert_eq!(scale.to_unsigned(1.2345), 1235);
        assert_eq!(scale.to_signed(-1.2345), -1235);
    }

    #[test]
    fn bitshift_factor() {
        let scale = FixedScale::new(ScaleMethod::Bitshift, 6);
        assert_eq!(scale.factor(), 64.0);
        assert_eq!(scale.to_unsigned(2.0), 128);
    }

    #[test]
    fn round_trip_within_scale_resolution() {
        let policy = ScalingPolicy::default();
        for value in [0.0, 0.5, 3.25, 1234.56789, 9.999e-7] {
            let stored = policy.means.to_unsigned(value);
            let recovered = policy.means.recover(stored);
            assert!(
                (recovered - value).abs() <= 1.0 / policy.means.factor(),
                "mean {value} recovered as {recovered}"
            );

            let stored = policy.stdevs.to_unsigned(value);
            let recovered = policy.stdevs.recover(stored);
            assert!((recovered - value).abs() <= 1.0 / policy.stdevs.factor());
        }
    }

    #[test]
    fn centroid_factor_composes_the_two_scalers() {
        let exponent = ScalingPolicy::new(ScaleMethod::Exponent, 10, 6);
        assert_eq!(exponent.centroid_factor(), 10_000.0);

        let bitshift = ScalingPolicy::new(ScaleMethod::Bitshift, 10, 6);
        assert_eq!(bitshift.centroid_factor(), 16.0);
    }

    #[test]
    fn splice_text_carries_the_factor_or_the_shift() {
        assert_eq!(
            FixedScale::new(ScaleMethod::Exponent, 10).splice_text(),
            " * 10000000000 "
        );
        assert_eq!(
            FixedScale::new(ScaleMethod::Bitshift, 10).splice_text(),
            " << 10 "
        );
    }

    #[test]
    fn scale_method_parses_from_configuration_tokens() {
        let method: ScaleMethod = serde_yaml::from_str("exponent").unwrap();
        assert_eq!(method, ScaleMethod::Exponent);
        let method: ScaleMethod = serde_yaml::from_str("bitshift").unwrap();
        assert_eq!(method, ScaleMethod::Bitshift);
        assert!(serde_yaml::from_str::<ScaleMethod>("decimal").is_err());
    }
}
