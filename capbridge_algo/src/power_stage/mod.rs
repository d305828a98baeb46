// Topology selection for the four-switch buck-boost stage. The measured
// secondary/primary voltage ratio picks one of four operating modes through
// asymmetric hysteresis bands, and every fast tick the mode's duty windows
// are (re)programmed into the stage driver. This layer is open-loop shaping:
// it runs whether or not output is enabled, because the duty limits must be
// in place before any enable and because the offline calibration modes are
// serviced here too.

pub mod driver;

use crate::config;
use driver::{Leg, PowerStageDriver};

/// Operating mode of the bridge.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum Topology {
    Buck,
    BuckBoost,
    BoostBuck,
    Boost,
    /// Fixed pattern for bench calibration of the primary current sensor.
    CalibratePrimary,
    /// Fixed pattern for bench calibration of the secondary current sensor.
    CalibrateSecondary,
}

/// Which current edge the current-mode comparators regulate on in the
/// present topology.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum CurrentSenseMode {
    SecondaryValley,
    PrimaryPeak,
}

/// Voltage-ratio thresholds for mode transitions. See `config::TOPOLOGY_BANDS`
/// for the tuned values; the asymmetry between up- and down-going thresholds
/// is what keeps the machine quiet at a boundary.
pub struct TopologyBands {
    pub buck_up: f32,
    pub buckboost_down: f32,
    pub buckboost_up: f32,
    pub boostbuck_down: f32,
    pub boostbuck_mid: f32,
    pub boostbuck_up: f32,
    pub boost_down: f32,
    pub boost_mid: f32,
}

/// Power-stage status record. Mode and duty fields are written by the fast
/// tick only; the output-enable flags change from the slow tick and the
/// fault path.
pub struct PowerStageState {
    pub topology: Topology,
    pub current_sense: CurrentSenseMode,
    /// Open-loop duty estimate `v_secondary / v_primary`.
    pub duty_by_voltage: f32,
    /// Conversion efficiency, advisory (see protection).
    pub efficiency: f32,

    pub output_main_enabled: bool,
    pub output_aux_enabled: bool,
    /// Enable permission from the upstream controller.
    pub allow_enable_output: bool,

    pub soft_start_cnt: u8,
    pub il_target: f32,
    pub il_limit: f32,

    pub aux_duty: f32,
    pub aux_duty_min: f32,
}

impl PowerStageState {
    pub const fn new() -> Self {
        Self {
            topology: Topology::Buck,
            current_sense: CurrentSenseMode::SecondaryValley,
            duty_by_voltage: 0.0,
            efficiency: 1.0,
            output_main_enabled: false,
            output_aux_enabled: false,
            allow_enable_output: cfg!(not(feature = "require-link")),
            soft_start_cnt: config::SOFT_START_TIME,
            il_target: 0.0,
            il_limit: config::MAX_INDUCTOR_CURRENT,
            aux_duty: 0.97,
            aux_duty_min: 0.0,
        }
    }

    /// One fast tick: update the mode from the measured ratio, then program
    /// the duty windows for whatever mode is now active.
    pub fn step<D: PowerStageDriver>(&mut self, v_primary: f32, v_secondary: f32, driver: &mut D) {
        self.duty_by_voltage = v_secondary.max(0.01) / v_primary;
        let r = self.duty_by_voltage;
        let bands = &config::TOPOLOGY_BANDS;

        self.topology = match self.topology {
            Topology::Buck if r > bands.buck_up => Topology::BuckBoost,
            Topology::BuckBoost if r < bands.buckboost_down => Topology::Buck,
            Topology::BuckBoost if r > bands.buckboost_up => Topology::BoostBuck,
            Topology::BoostBuck if r < bands.boostbuck_down => Topology::Buck,
            Topology::BoostBuck if r < bands.boostbuck_mid => Topology::BuckBoost,
            Topology::BoostBuck if r > bands.boostbuck_up => Topology::Boost,
            Topology::Boost if r < bands.boost_down => Topology::Buck,
            Topology::Boost if r < bands.boost_mid => Topology::BoostBuck,
            other => other,
        };

        match self.topology {
            Topology::Buck => {
                driver.set_leg_duty_limit(
                    Leg::Primary,
                    config::DUTY_LIMIT_LOW,
                    config::DUTY_LIMIT_HIGH_BUCK,
                );
                driver.hold_leg_on(Leg::Secondary);
                self.current_sense = CurrentSenseMode::SecondaryValley;
            }
            Topology::BuckBoost => {
                driver.set_leg_duty_limit(
                    Leg::Primary,
                    config::DUTY_LIMIT_LOW,
                    config::DUTY_LIMIT_HIGH,
                );
                let (lo, hi) = config::DUTY_FIXED_WINDOW;
                driver.set_leg_duty_limit(Leg::Secondary, lo, hi);
                self.current_sense = CurrentSenseMode::SecondaryValley;
            }
            Topology::BoostBuck => {
                let (lo, hi) = config::DUTY_FIXED_WINDOW;
                driver.set_leg_duty_limit(Leg::Primary, lo, hi);
                driver.set_leg_duty_limit(
                    Leg::Secondary,
                    config::DUTY_LIMIT_LOW,
                    secondary_bound(v_primary, v_secondary, config::DUTY_FIXED_RATIO),
                );
                self.current_sense = CurrentSenseMode::PrimaryPeak;
            }
            Topology::Boost => {
                driver.hold_leg_on(Leg::Primary);
                driver.set_leg_duty_limit(
                    Leg::Secondary,
                    config::DUTY_LIMIT_LOW,
                    secondary_bound(v_primary, v_secondary, 1.0),
                );
                self.current_sense = CurrentSenseMode::PrimaryPeak;
            }
            Topology::CalibratePrimary => {
                driver.hold_leg_on(Leg::Primary);
                let (lo, hi) = config::DUTY_CAL_SECONDARY_WINDOW;
                driver.set_leg_duty_limit(Leg::Secondary, lo, hi);
            }
            Topology::CalibrateSecondary => {
                let (lo, hi) = config::DUTY_CAL_PRIMARY_WINDOW;
                driver.set_leg_duty_limit(Leg::Primary, lo, hi);
                driver.hold_leg_on(Leg::Secondary);
            }
        }
    }
}

/// Upper duty bound for the secondary leg in the boost-family modes. Tightens
/// once the bank voltage passes 101 % of its rating so the voltage-derived
/// duty estimate cannot push the leg past what the rating allows.
fn secondary_bound(v_primary: f32, v_secondary: f32, transfer: f32) -> f32 {
    if v_secondary < config::CAP_MAX_VOLTAGE * 1.01 {
        config::DUTY_SECONDARY_BOUND
    } else {
        1.0 - (v_primary * transfer) / config::VSEC_LIMIT_BY_DUTY
    }
}

#[cfg(test)]
mod tests {
    use super::driver::mock::MockDriver;
    use super::*;

    fn step_ratio(ps: &mut PowerStageState, d: &mut MockDriver, ratio: f32) {
        // 24 V primary, secondary chosen to hit the requested ratio.
        ps.step(24.0, 24.0 * ratio, d);
    }

    #[test]
    fn dither_at_boundary_cannot_chatter() {
        let mut ps = PowerStageState::new();
        let mut d = MockDriver::default();
        assert_eq!(ps.topology, Topology::Buck);

        let mut transitions = 0;
        let mut last = ps.topology;
        for i in 0..100 {
            let ratio = if i % 2 == 0 { 0.85 } else { 0.83 };
            step_ratio(&mut ps, &mut d, ratio);
            if ps.topology != last {
                transitions += 1;
                last = ps.topology;
            }
        }
        // One entry into BuckBoost, then the hysteresis band holds it.
        assert_eq!(transitions, 1);
        assert_eq!(ps.topology, Topology::BuckBoost);
    }

    #[test]
    fn walks_up_and_down_through_all_modes() {
        let mut ps = PowerStageState::new();
        let mut d = MockDriver::default();
        step_ratio(&mut ps, &mut d, 0.90);
        assert_eq!(ps.topology, Topology::BuckBoost);
        step_ratio(&mut ps, &mut d, 1.05);
        assert_eq!(ps.topology, Topology::BoostBuck);
        assert_eq!(ps.current_sense, CurrentSenseMode::PrimaryPeak);
        step_ratio(&mut ps, &mut d, 1.30);
        assert_eq!(ps.topology, Topology::Boost);
        step_ratio(&mut ps, &mut d, 1.20);
        assert_eq!(ps.topology, Topology::Boost);
        step_ratio(&mut ps, &mut d, 1.10);
        assert_eq!(ps.topology, Topology::BoostBuck);
        step_ratio(&mut ps, &mut d, 0.50);
        assert_eq!(ps.topology, Topology::Buck);
        assert_eq!(ps.current_sense, CurrentSenseMode::SecondaryValley);
    }

    #[test]
    fn boost_secondary_bound_tightens_near_rating() {
        let mut ps = PowerStageState::new();
        let mut d = MockDriver::default();
        ps.topology = Topology::Boost;

        // Below 101 % of rating: fixed bound.
        ps.step(24.0, config::CAP_MAX_VOLTAGE, &mut d);
        assert_eq!(
            d.secondary_window,
            Some((config::DUTY_LIMIT_LOW, config::DUTY_SECONDARY_BOUND))
        );

        // Above: bound derived from the primary voltage.
        ps.step(24.0, config::CAP_MAX_VOLTAGE * 1.02, &mut d);
        let (_, hi) = d.secondary_window.unwrap();
        assert!((hi - (1.0 - 24.0 / config::VSEC_LIMIT_BY_DUTY)).abs() < 1e-6);
        assert!(hi < config::DUTY_SECONDARY_BOUND);
    }

    #[test]
    fn calibration_modes_ignore_the_ratio() {
        let mut ps = PowerStageState::new();
        let mut d = MockDriver::default();
        ps.topology = Topology::CalibratePrimary;
        step_ratio(&mut ps, &mut d, 2.0);
        assert_eq!(ps.topology, Topology::CalibratePrimary);
        assert_eq!(d.secondary_window, Some(config::DUTY_CAL_SECONDARY_WINDOW));
        assert_eq!(d.primary_window, None);
    }
}
