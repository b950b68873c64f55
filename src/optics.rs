//! Conversion between galvo drive voltage and beam displacement at the sample.
//!
//! The beam leaves the galvo pair through a 4f relay (`f1`, `f2`), reflects off
//! a 45° fold mirror above the sample holder and enters the objective. The
//! model solves that triangle with the law of sines to find where the ray hits
//! the fold mirror, then projects the resulting ray angle through the objective
//! to a lateral displacement in the focal plane.

use serde::{Deserialize, Serialize};
use std::f64::consts::SQRT_2;

use crate::error::GalvoError;

const FOLD_MIRROR_ANGLE_DEG: f64 = 45.0;
const DEGENERATE_EPSILON: f64 = 1e-12;

/// Galvo servo input scaling in volts per mechanical degree.
///
/// The GVS012 driver board can be jumpered for 0.5, 0.8 or 1 V/°.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum GalvoScaling {
    HalfVoltPerDegree,
    EightTenthsVoltPerDegree,
    #[default]
    OneVoltPerDegree,
}

impl GalvoScaling {
    pub fn volts_per_degree(self) -> f64 {
        match self {
            GalvoScaling::HalfVoltPerDegree => 0.5,
            GalvoScaling::EightTenthsVoltPerDegree => 0.8,
            GalvoScaling::OneVoltPerDegree => 1.0,
        }
    }
}

impl TryFrom<f64> for GalvoScaling {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if value == 0.5 {
            Ok(GalvoScaling::HalfVoltPerDegree)
        } else if value == 0.8 {
            Ok(GalvoScaling::EightTenthsVoltPerDegree)
        } else if value == 1.0 {
            Ok(GalvoScaling::OneVoltPerDegree)
        } else {
            Err(format!(
                "galvo scaling must be 0.5, 0.8 or 1.0 V/degree, got {value}"
            ))
        }
    }
}

impl From<GalvoScaling> for f64 {
    fn from(scaling: GalvoScaling) -> Self {
        scaling.volts_per_degree()
    }
}

/// Fixed optical geometry between the galvos and the sample (lengths in mm)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpticalModel {
    pub scaling: GalvoScaling,
    /// Relay lens next to the galvos
    pub f1_mm: f64,
    /// Tube lens
    pub f2_mm: f64,
    /// Tube lens to the fold mirror over the sample holder
    pub tube_to_mirror_mm: f64,
    /// Fold mirror to sample
    pub mirror_to_sample_mm: f64,
    pub working_distance_mm: f64,
    /// Thickness of the back of the objective
    pub back_objective_mm: f64,
}

impl Default for OpticalModel {
    fn default() -> Self {
        Self {
            scaling: GalvoScaling::default(),
            f1_mm: 100.0,
            f2_mm: 125.0,
            tube_to_mirror_mm: 93.4,
            mirror_to_sample_mm: 71.6,
            working_distance_mm: 1.0,
            back_objective_mm: 1.7,
        }
    }
}

impl OpticalModel {
    pub fn with_scaling(mut self, scaling: GalvoScaling) -> Self {
        self.scaling = scaling;
        self
    }

    fn focal_depth_mm(&self) -> f64 {
        self.working_distance_mm + self.back_objective_mm
    }

    /// Distance from the centre of the field, in micrometres, that `voltage` moves the beam
    pub fn voltage_to_distance(&self, voltage: f64) -> Result<f64, GalvoError> {
        if !voltage.is_finite() {
            return Err(GalvoError::Domain(format!("voltage {voltage} is not finite")));
        }

        // Optical angle after the relay, in degrees
        let a = 2.0 * voltage * (self.f1_mm / self.f2_mm) / self.scaling.volts_per_degree();
        let c = FOLD_MIRROR_ANGLE_DEG - a;

        let sin_c = c.to_radians().sin();
        if sin_c.abs() < DEGENERATE_EPSILON {
            return Err(GalvoError::Domain(format!(
                "{voltage} V puts the ray parallel to the fold mirror"
            )));
        }
        let x2 = self.tube_to_mirror_mm * a.to_radians().sin() / sin_c;

        let ratio = x2 / (SQRT_2 * (self.mirror_to_sample_mm - x2 / SQRT_2));
        if !ratio.is_finite() || ratio.abs() >= 1.0 {
            return Err(GalvoError::Domain(format!(
                "{voltage} V deflects the ray past the objective (sin φ = {ratio:.4})"
            )));
        }

        let phi = ratio.asin();
        Ok(self.focal_depth_mm() * phi.tan() * 1000.0)
    }

    /// Voltage needed to move the beam `distance_um` from the centre of the field
    pub fn distance_to_voltage(&self, distance_um: f64) -> Result<f64, GalvoError> {
        if !distance_um.is_finite() {
            return Err(GalvoError::Domain(format!(
                "distance {distance_um} um is not finite"
            )));
        }

        let phi = (distance_um / 1000.0 / self.focal_depth_mm()).atan();
        let sin_phi = phi.sin();
        // |φ| < 90°, so 1 + sin φ stays positive
        let x2 = SQRT_2 * self.mirror_to_sample_mm * sin_phi / (1.0 + sin_phi);

        let denominator = x2 + SQRT_2 * self.tube_to_mirror_mm;
        if denominator <= DEGENERATE_EPSILON {
            return Err(GalvoError::Domain(format!(
                "{distance_um} um is outside the reachable field"
            )));
        }

        let a = (x2 / denominator).atan().to_degrees();
        let voltage = self.scaling.volts_per_degree() * a * self.f2_mm / (2.0 * self.f1_mm);
        if !voltage.is_finite() {
            return Err(GalvoError::Domain(format!(
                "{distance_um} um produced a non-finite voltage"
            )));
        }
        Ok(voltage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_origin_maps_to_origin() {
        let optics = OpticalModel::default();
        assert_abs_diff_eq!(optics.voltage_to_distance(0.0).unwrap(), 0.0);
        assert_abs_diff_eq!(optics.distance_to_voltage(0.0).unwrap(), 0.0);
    }

    #[test]
    fn test_round_trip_over_operating_region() {
        let optics = OpticalModel::default();
        for step in -18..=18 {
            let voltage = step as f64 * 0.5;
            let distance = optics.voltage_to_distance(voltage).unwrap();
            let back = optics.distance_to_voltage(distance).unwrap();
            assert_abs_diff_eq!(back, voltage, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_round_trip_for_every_scaling() {
        for scaling in [
            GalvoScaling::HalfVoltPerDegree,
            GalvoScaling::EightTenthsVoltPerDegree,
            GalvoScaling::OneVoltPerDegree,
        ] {
            let optics = OpticalModel::default().with_scaling(scaling);
            for distance in [-300.0, -25.0, 3.5, 25.0, 300.0] {
                let voltage = optics.distance_to_voltage(distance).unwrap();
                let back = optics.voltage_to_distance(voltage).unwrap();
                assert_abs_diff_eq!(back, distance, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_known_values() {
        let optics = OpticalModel::default();
        assert_abs_diff_eq!(
            optics.voltage_to_distance(1.0).unwrap(),
            105.228_447_467,
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            optics.distance_to_voltage(25.0).unwrap(),
            0.250_076_697_647_51,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_scaling_is_linear_in_voltage() {
        let full = OpticalModel::default();
        let half = full.with_scaling(GalvoScaling::HalfVoltPerDegree);
        let v_full = full.distance_to_voltage(25.0).unwrap();
        let v_half = half.distance_to_voltage(25.0).unwrap();
        assert_abs_diff_eq!(v_half, v_full * 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_displacement_is_odd_near_centre() {
        let optics = OpticalModel::default();
        let positive = optics.voltage_to_distance(0.01).unwrap();
        let negative = optics.voltage_to_distance(-0.01).unwrap();
        assert!(positive > 0.0);
        assert!(negative < 0.0);
    }

    #[test]
    fn test_voltage_past_objective_is_domain_error() {
        let optics = OpticalModel::default();
        assert!(matches!(
            optics.voltage_to_distance(10.0),
            Err(GalvoError::Domain(_))
        ));

        let half = optics.with_scaling(GalvoScaling::HalfVoltPerDegree);
        assert!(matches!(
            half.voltage_to_distance(5.0),
            Err(GalvoError::Domain(_))
        ));
    }

    #[test]
    fn test_ray_parallel_to_mirror_is_domain_error() {
        // a = 45° when V = 45 * f2 / (2 * f1) at 1 V/°
        let optics = OpticalModel::default();
        assert!(matches!(
            optics.voltage_to_distance(28.125),
            Err(GalvoError::Domain(_))
        ));
    }

    #[test]
    fn test_non_finite_inputs_are_rejected() {
        let optics = OpticalModel::default();
        assert!(optics.voltage_to_distance(f64::NAN).is_err());
        assert!(optics.distance_to_voltage(f64::INFINITY).is_err());
    }

    #[test]
    fn test_unreachable_distance_is_domain_error() {
        let optics = OpticalModel::default();
        assert!(matches!(
            optics.distance_to_voltage(-5000.0),
            Err(GalvoError::Domain(_))
        ));
    }

    #[test]
    fn test_scaling_parses_only_supported_values() {
        assert_eq!(GalvoScaling::try_from(0.8), Ok(GalvoScaling::EightTenthsVoltPerDegree));
        assert!(GalvoScaling::try_from(0.7).is_err());
    }
}
