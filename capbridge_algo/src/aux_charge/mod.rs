// Supervisor for the auxiliary charging output group (wireless receiver on
// the E half-bridge). The fast tick runs a slow integrating duty loop that
// regulates the receiver voltage; the housekeeping tick decides whether the
// group may run at all and classifies the session for telemetry. The
// receiver only assists charging: everything here rides on top of the main
// converter and none of it gates the main output.

use crate::analog::SampleState;
use crate::capbank::CapBankLimits;
use crate::config;
use crate::power_stage::driver::PowerStageDriver;
use crate::power_stage::PowerStageState;

/// Charging-session classification, reported in the status byte.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ChargeStatus {
    /// Receiver hardware absent or faulted.
    Error,
    Off,
    Charging,
    /// Bank above 99 % of rating: session complete.
    Finished,
}

impl ChargeStatus {
    pub fn wire_code(self) -> u8 {
        match self {
            ChargeStatus::Error => 0,
            ChargeStatus::Off => 1,
            ChargeStatus::Charging => 2,
            ChargeStatus::Finished => 3,
        }
    }
}

pub struct AuxCharger {
    pub status: ChargeStatus,
    /// Whether the receiver is being asked for full power.
    pub power_request: bool,
    low_power_cnt: u16,
}

impl AuxCharger {
    pub const fn new() -> Self {
        Self {
            status: ChargeStatus::Off,
            power_request: false,
            low_power_cnt: 0,
        }
    }

    /// Fast-tick duty regulation of the receiver output. While the group is
    /// off the duty parks just under full so the next enable starts from a
    /// near-passthrough point.
    pub fn fast_tick<D: PowerStageDriver>(
        &mut self,
        s: &SampleState,
        ps: &mut PowerStageState,
        driver: &mut D,
    ) {
        if ps.output_aux_enabled {
            ps.aux_duty += config::AUX_VOLTAGE_KI * (s.v_aux - config::AUX_VOLTAGE_TARGET);
            ps.aux_duty_min = s.v_secondary / config::VAUX_LIMIT_BY_DUTY;
            // Floor first: near the rating the floor can pass the ceiling
            // and the ceiling must win.
            ps.aux_duty = ps.aux_duty.max(ps.aux_duty_min).min(0.99);
        } else {
            ps.aux_duty = 0.97;
        }
        driver.set_aux_duty(ps.aux_duty);
    }

    /// Housekeeping-tick arbitration of the aux output group.
    pub fn supervise<D: PowerStageDriver>(
        &mut self,
        s: &SampleState,
        limits: &CapBankLimits,
        ps: &mut PowerStageState,
        driver: &mut D,
    ) {
        if ps.output_aux_enabled {
            if s.v_cap_lf > config::CAP_MAX_VOLTAGE * 1.01 {
                self.power_request = false;
                self.status = ChargeStatus::Error;
            } else if s.v_cap_lf > config::CAP_MAX_VOLTAGE * 0.99 {
                self.power_request = false;
                self.status = ChargeStatus::Finished;
            } else {
                // Ask for full receiver power only while the bank can take
                // it on top of what the referee bus is already supplying.
                self.power_request =
                    s.v_cap * limits.max_in > s.p_referee_lf + 120.0;
                self.status = ChargeStatus::Charging;
            }

            if s.p_aux_lf > config::AUX_POWER_LIMIT {
                self.power_request = false;
                self.status = ChargeStatus::Error;
            }

            if !ps.output_main_enabled
                || s.v_aux < s.v_secondary
                || self.low_power_cnt > config::AUX_LOW_POWER_TICKS
            {
                driver.disable_aux();
                ps.output_aux_enabled = false;
                self.low_power_cnt = 0;
                self.status = ChargeStatus::Off;
            }
        } else if ps.output_main_enabled && s.v_aux > config::AUX_START_VOLTAGE {
            if driver.enable_aux(0.96) {
                ps.output_aux_enabled = true;
                ps.aux_duty = 0.96;
                self.power_request = false;
                self.status = ChargeStatus::Charging;
            }
        }
    }

    /// Slow phase 3: debounce of a receiver that stopped delivering power.
    pub fn count_low_power(&mut self, s: &SampleState, aux_enabled: bool) {
        if aux_enabled {
            if s.p_aux_lf < config::AUX_LOW_POWER_LEVEL {
                self.low_power_cnt += 1;
            } else {
                self.low_power_cnt = 0;
            }
        } else {
            self.low_power_cnt = 0;
        }
    }
}
