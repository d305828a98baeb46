// Cascaded power/current control. Every enabled fast tick the primary
// increment controller proposes a step toward the referee power target
// (expressed as a reference-current setpoint), three proportional safety
// terms propose steps of their own, and a fixed-priority tie-break picks the
// single increment that gets integrated into the inductor current target.
// Which constraint won is first-class state: it gates the referee bias loop
// and is reported in every status frame.

pub mod referee;

use crate::analog::SampleState;
use crate::capbank::CapBankLimits;
use crate::config;
use crate::math::increment_pid::IncrementPid;
use crate::power_stage::driver::PowerStageDriver;
use crate::power_stage::PowerStageState;
use crate::protection::ErrorState;
use crate::telemetry::Command;
use referee::RefereeLoop;

/// Constraint that last bounded the inductor current target.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum LimitFactor {
    RefereePower,
    CapVoltageMax,
    CapVoltageNormal,
    CapCurrentCharge,
    CapCurrentDischarge,
}

impl LimitFactor {
    /// Two-bit status-frame code; both current limits share the last slot.
    pub fn wire_code(self) -> u8 {
        match self {
            LimitFactor::RefereePower => 0,
            LimitFactor::CapVoltageMax => 1,
            LimitFactor::CapVoltageNormal => 2,
            LimitFactor::CapCurrentCharge | LimitFactor::CapCurrentDischarge => 3,
        }
    }
}

pub struct ControlState {
    pub pid: IncrementPid,
    pub limit_factor: LimitFactor,

    /// Charge-allow hysteresis decision around `v_cap_target`.
    pub allow_charge: bool,
    /// Bank voltage the active charging limit regulates to.
    pub v_cap_target: f32,

    pub referee: RefereeLoop,

    /// Winning increment and the competing limit terms of the last tick.
    pub delta_il: f32,
    pub d_il_v_cap_max: f32,
    pub d_il_charge: f32,
    pub d_il_discharge: f32,
}

impl ControlState {
    pub const fn new() -> Self {
        let (ktp, kmp, ki, kd) = config::IR_PID_GAINS;
        Self {
            pid: IncrementPid::new(ktp, kmp, ki, kd),
            limit_factor: LimitFactor::RefereePower,
            allow_charge: false,
            v_cap_target: config::CAP_MAX_VOLTAGE,
            referee: RefereeLoop::new(),
            delta_il: 0.0,
            d_il_v_cap_max: 0.0,
            d_il_charge: 0.0,
            d_il_discharge: 0.0,
        }
    }

    /// One enabled fast tick of the cascaded loop. Recomputes the bank
    /// current ceilings, arbitrates the limit terms and integrates the
    /// winner into `ps.il_target`.
    pub fn update(
        &mut self,
        s: &SampleState,
        limits: &mut CapBankLimits,
        ps: &mut PowerStageState,
        active_limit_enabled: bool,
    ) {
        limits.update(s.v_cap);

        // Hysteresis around the charge target: inside the +/-0.1 V band the
        // previous decision stands, so the loop cannot chatter between
        // charge and hold at the setpoint.
        if s.v_cap > self.v_cap_target + 0.1 {
            self.allow_charge = false;
        } else if s.v_cap < self.v_cap_target - 0.1 {
            self.allow_charge = true;
        }

        if (self.allow_charge || !active_limit_enabled) && ps.soft_start_cnt == 0 {
            self.pid
                .compute_delta(self.referee.p_target / s.v_primary, s.i_reference);
            self.limit_factor = LimitFactor::RefereePower;
        } else {
            // Held off the target (or still soft-starting): creep back with
            // a fixed low power so the bank voltage re-approaches gently.
            self.pid
                .compute_delta(config::CHARGE_HOLDOFF_POWER / s.v_primary, s.i_reference);
            self.limit_factor = LimitFactor::CapVoltageNormal;
        }
        self.delta_il = self.pid.output();

        self.d_il_v_cap_max = config::VOLTAGE_LIMIT_KI * (config::CAP_MAX_VOLTAGE - s.v_cap);
        self.d_il_charge = config::CURRENT_LIMIT_KI * (limits.max_in - s.i_cap);
        self.d_il_discharge = config::CURRENT_LIMIT_KI * (-s.i_cap - limits.max_out);

        // Fixed-priority tie-break: the first qualifying, more-restrictive
        // term overrides the candidate. Exactly one override can win.
        if s.v_cap > config::CAP_MAX_VOLTAGE * 0.95 && self.d_il_v_cap_max < self.delta_il {
            self.delta_il = self.d_il_v_cap_max;
            self.limit_factor = LimitFactor::CapVoltageMax;
        } else if s.i_cap > limits.max_in && self.d_il_charge < self.delta_il {
            self.delta_il = self.d_il_charge;
            self.limit_factor = LimitFactor::CapCurrentCharge;
        } else if s.i_cap < -limits.max_out && self.d_il_discharge > self.delta_il {
            self.delta_il = self.d_il_discharge;
            self.limit_factor = LimitFactor::CapCurrentDischarge;
        }

        ps.il_target = (ps.il_target + self.delta_il).clamp(-ps.il_limit, ps.il_limit);
    }

    /// Reverts to the no-link defaults once the command stream goes quiet.
    /// Returns true on the tick the link was declared lost.
    pub fn check_rx_timeout(&mut self, command: &mut Command, tick: u32) -> bool {
        let _ = &command;
        if !self.referee.connected
            || tick.wrapping_sub(self.referee.last_rx_tick) <= config::COMMAND_TIMEOUT_TICKS
        {
            return false;
        }
        self.referee.reset_to_default();
        #[cfg(feature = "require-link")]
        {
            // Link-gated builds fall back to a safe autonomous profile until
            // the upstream controller reappears.
            self.v_cap_target = config::CAP_MAX_VOLTAGE;
            *command = Command {
                enable_output: true,
                power_limit: config::REFEREE_DEFAULT_POWER as u16,
                ..Command::default()
            };
        }
        true
    }
}

/// Per-slow-tick output arbitration: UVLO drops the output inside the tick
/// it is seen; recovery re-enables automatically once the error gate and the
/// upstream permission allow it.
pub fn arbitrate_output<D: PowerStageDriver>(
    ps: &mut PowerStageState,
    s: &SampleState,
    errors: &ErrorState,
    driver: &mut D,
) {
    if ps.output_main_enabled {
        if s.v_primary < config::UVLO_LIMIT {
            driver.disable_main();
            ps.output_main_enabled = false;
            ps.soft_start_cnt = config::SOFT_START_TIME;
        } else if ps.soft_start_cnt > 0 {
            ps.soft_start_cnt -= 1;
        }
    } else {
        if s.v_primary > config::UVLO_RECOVERY
            && errors.output_permitted()
            && ps.allow_enable_output
            && driver.enable_main()
        {
            ps.output_main_enabled = true;
        }
        ps.soft_start_cnt = config::SOFT_START_TIME;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_stage::driver::mock::MockDriver;

    fn ready_stage() -> PowerStageState {
        let mut ps = PowerStageState::new();
        ps.output_main_enabled = true;
        ps.soft_start_cnt = 0;
        ps
    }

    fn samples(v_primary: f32, v_cap: f32, i_cap: f32, i_reference: f32) -> SampleState {
        let mut s = SampleState::new();
        s.v_primary = v_primary;
        s.v_cap = v_cap;
        s.i_cap = i_cap;
        s.i_reference = i_reference;
        s
    }

    #[test]
    fn overvoltage_term_wins_exactly_at_96_percent() {
        let mut c = ControlState::new();
        let mut limits = CapBankLimits::new();
        let mut ps = ready_stage();
        let s = samples(24.0, config::CAP_MAX_VOLTAGE * 0.96, 0.0, 0.0);

        c.update(&s, &mut limits, &mut ps, false);

        // The referee-power candidate on a fresh controller is well above
        // the overvoltage term; the override must be an exact replacement.
        assert_eq!(c.limit_factor, LimitFactor::CapVoltageMax);
        assert_eq!(c.delta_il, c.d_il_v_cap_max);
        assert_eq!(ps.il_target, c.d_il_v_cap_max);
    }

    #[test]
    fn charge_current_excess_overrides_when_more_restrictive() {
        let mut c = ControlState::new();
        let mut limits = CapBankLimits::new();
        let mut ps = ready_stage();
        let s = samples(24.0, 20.0, config::CAP_MAX_CURRENT + 5.0, 0.0);

        c.update(&s, &mut limits, &mut ps, false);
        assert_eq!(c.limit_factor, LimitFactor::CapCurrentCharge);
        assert!(c.delta_il < 0.0);
    }

    #[test]
    fn discharge_excess_pulls_the_target_back_up() {
        let mut c = ControlState::new();
        let mut limits = CapBankLimits::new();
        let mut ps = ready_stage();
        ps.il_target = -10.0;
        let s = samples(24.0, 20.0, -(config::CAP_MAX_CURRENT + 5.0), 5.0);

        c.update(&s, &mut limits, &mut ps, false);
        assert_eq!(c.limit_factor, LimitFactor::CapCurrentDischarge);
        assert_eq!(c.delta_il, c.d_il_discharge);
        assert!(c.delta_il > 0.0);
    }

    #[test]
    fn charge_allow_hysteresis_holds_inside_the_band() {
        let mut c = ControlState::new();
        c.v_cap_target = 20.0;
        let mut limits = CapBankLimits::new();
        let mut ps = ready_stage();

        // Inside the band the initial "deny" decision stands.
        c.update(&samples(24.0, 20.05, 0.0, 0.0), &mut limits, &mut ps, true);
        assert!(!c.allow_charge);
        assert_eq!(c.limit_factor, LimitFactor::CapVoltageNormal);

        // Below the band: charging (re)allowed, referee regime resumes.
        c.update(&samples(24.0, 19.8, 0.0, 0.0), &mut limits, &mut ps, true);
        assert!(c.allow_charge);
        assert_eq!(c.limit_factor, LimitFactor::RefereePower);

        // Back inside the band: the new decision is retained.
        c.update(&samples(24.0, 20.05, 0.0, 0.0), &mut limits, &mut ps, true);
        assert!(c.allow_charge);

        // Above the band: denied again.
        c.update(&samples(24.0, 20.15, 0.0, 0.0), &mut limits, &mut ps, true);
        assert!(!c.allow_charge);
    }

    #[test]
    fn soft_start_keeps_the_holdoff_regime() {
        let mut c = ControlState::new();
        let mut limits = CapBankLimits::new();
        let mut ps = ready_stage();
        ps.soft_start_cnt = 3;

        c.update(&samples(24.0, 15.0, 0.0, 0.0), &mut limits, &mut ps, false);
        assert_eq!(c.limit_factor, LimitFactor::CapVoltageNormal);
    }

    #[test]
    fn il_target_clamps_to_the_hard_limit() {
        let mut c = ControlState::new();
        let mut limits = CapBankLimits::new();
        let mut ps = ready_stage();
        ps.il_target = config::MAX_INDUCTOR_CURRENT - 0.01;
        // Large positive candidate from a big target step.
        let s = samples(10.0, 15.0, 0.0, 0.0);
        c.update(&s, &mut limits, &mut ps, false);
        assert!(ps.il_target <= config::MAX_INDUCTOR_CURRENT);
    }

    #[test]
    fn uvlo_disables_within_the_tick_and_reloads_soft_start() {
        let mut ps = ready_stage();
        let mut d = MockDriver::default();
        d.main_enabled = true;
        let e = ErrorState::new();

        let s = samples(config::UVLO_LIMIT - 0.5, 20.0, 0.0, 0.0);
        arbitrate_output(&mut ps, &s, &e, &mut d);
        assert!(!ps.output_main_enabled);
        assert!(!d.main_enabled);
        assert_eq!(ps.soft_start_cnt, config::SOFT_START_TIME);

        // Recovery above the release threshold re-enables automatically.
        let s = samples(config::UVLO_RECOVERY + 0.5, 20.0, 0.0, 0.0);
        arbitrate_output(&mut ps, &s, &e, &mut d);
        assert!(ps.output_main_enabled);
    }

    #[test]
    fn rx_timeout_reverts_to_the_default_power_target() {
        let mut c = ControlState::new();
        let mut cmd = Command::default();
        c.referee.connected = true;
        c.referee.last_rx_tick = 100;
        c.referee.p_target = 120.0;

        assert!(!c.check_rx_timeout(&mut cmd, 400));
        assert!(c.check_rx_timeout(&mut cmd, 601));
        assert!(!c.referee.connected);
        assert_eq!(c.referee.p_target, config::REFEREE_DEFAULT_POWER);
    }
}
