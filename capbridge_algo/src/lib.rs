#![cfg_attr(not(feature = "std"), no_std)]

pub mod analog;
pub mod aux_charge;
pub mod calibration;
pub mod capbank;
pub mod config;
pub mod control;
pub mod math;
pub mod power_stage;
pub mod protection;
pub mod telemetry;

use analog::{RawFrame, SampleState};
use aux_charge::AuxCharger;
use capbank::capacity::CapacityEstimator;
use capbank::CapBankLimits;
use control::{ControlState, LimitFactor};
use power_stage::driver::PowerStageDriver;
use power_stage::PowerStageState;
use protection::{ErrorState, FaultFlags};
use telemetry::{Command, Frame, StatusView};

/// What the caller must do after applying a command frame.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum CommandAction {
    None,
    /// Output is already off; force a hardware reset, unconditionally.
    Restart,
}

/// Results of one housekeeping tick for the interface/bus glue.
pub struct SlowOutput {
    /// Round-robin phase that just executed (0..=3).
    pub phase: u8,
    /// Status frame to put on the bus (phase 1).
    pub status_frame: Option<Frame>,
    /// Capacity estimator crossed its anomaly level (advisory).
    pub capacity_alert: bool,
    /// Command stream went quiet this tick.
    pub link_lost: bool,
}

/// The converter control core: owns every state record and the power-stage
/// driver, and exposes one entry point per execution context. The fast tick
/// is the single writer of the sample, mode and loop state; the slow tick
/// owns error decay and estimator evaluation; command and fault entry points
/// are called from their interrupts and only touch their documented fields.
pub struct PowerController<D: PowerStageDriver> {
    pub driver: D,
    pub samples: SampleState,
    pub power_stage: PowerStageState,
    pub control: ControlState,
    pub limits: CapBankLimits,
    pub estimator: CapacityEstimator,
    pub errors: ErrorState,
    pub aux: AuxCharger,
    /// Most recent command frame (or the defaults before any arrived).
    pub command: Command,

    tick: u32,
    slow_phase: u8,
}

impl<D: PowerStageDriver> PowerController<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            samples: SampleState::new(),
            power_stage: PowerStageState::new(),
            control: ControlState::new(),
            limits: CapBankLimits::new(),
            estimator: CapacityEstimator::new(),
            errors: ErrorState::new(),
            aux: AuxCharger::new(),
            command: Command::default(),
            tick: 0,
            slow_phase: 0,
        }
    }

    /// Housekeeping tick count (slow phase 0 cadence).
    pub fn tick_count(&self) -> u32 {
        self.tick
    }

    /// Checks the MCU unique id against the calibration table. A mismatch
    /// means this binary's current scaling belongs to a different power
    /// stage; running it would make every protection threshold wrong.
    pub fn verify_hardware_identity(&mut self, uid: &[u32; 3]) -> bool {
        if *uid != calibration::table().uid {
            self.errors.mark_identity_fault();
            return false;
        }
        true
    }

    /// Fast tick: sampler, topology shaping, then (output permitting) the
    /// protection checks and the cascaded loop. Short-circuit detection runs
    /// on this tick's samples, before the loop, never batched.
    pub fn tick_fast(&mut self, raw: &RawFrame) {
        self.samples.ingest(raw);
        self.power_stage.step(
            self.samples.v_primary,
            self.samples.v_secondary,
            &mut self.driver,
        );

        if self.power_stage.output_main_enabled {
            if self.errors.check_short_circuit(&self.samples) {
                self.driver.disable_main();
                self.power_stage.output_main_enabled = false;
            }

            self.control.update(
                &self.samples,
                &mut self.limits,
                &mut self.power_stage,
                self.command.enable_active_charging_limit,
            );
            self.driver.set_current_reference(self.power_stage.il_target);

            protection::update_efficiency(&mut self.power_stage, &self.samples);
            self.estimator.track_current(self.samples.i_secondary);
        } else {
            // Hold a small discharge bias so the bank bleeds toward the
            // primary bus instead of floating, and keep the loop history
            // clear for the next enable.
            self.power_stage.il_target = config::IDLE_CURRENT_TARGET;
            self.control.delta_il = 0.0;
            self.control.pid.reset();
        }

        if config::AUX_CHARGER_FITTED {
            self.aux
                .fast_tick(&self.samples, &mut self.power_stage, &mut self.driver);
        }
    }

    /// Housekeeping tick: one round-robin phase plus the unconditional
    /// output arbitration.
    pub fn tick_slow(&mut self) -> SlowOutput {
        let mut out = SlowOutput {
            phase: self.slow_phase,
            status_frame: None,
            capacity_alert: false,
            link_lost: false,
        };

        match self.slow_phase {
            0 => {
                self.tick = self.tick.wrapping_add(1);
                self.errors.decay(self.samples.v_primary);
            }
            1 => {
                out.status_frame = Some(self.build_status_frame());
                out.link_lost = self.control.check_rx_timeout(&mut self.command, self.tick);
                #[cfg(feature = "require-link")]
                if out.link_lost {
                    self.errors.code |= protection::WARNING_COM_TIMEOUT;
                }
            }
            2 => {
                if self.power_stage.output_main_enabled {
                    out.capacity_alert = self.estimator.evaluate(
                        self.samples.v_cap_lf,
                        self.samples.i_cap_lf,
                        self.samples.i_secondary,
                        self.tick,
                    );
                }
            }
            _ => {
                self.errors.check_low_battery(self.samples.v_primary);
                if config::AUX_CHARGER_FITTED {
                    self.aux
                        .count_low_power(&self.samples, self.power_stage.output_aux_enabled);
                }
            }
        }
        self.slow_phase = (self.slow_phase + 1) & 0b11;

        control::arbitrate_output(
            &mut self.power_stage,
            &self.samples,
            &self.errors,
            &mut self.driver,
        );
        if config::AUX_CHARGER_FITTED {
            self.aux.supervise(
                &self.samples,
                &self.limits,
                &mut self.power_stage,
                &mut self.driver,
            );
        }

        out
    }

    /// Applies a validated command frame from the bus.
    pub fn on_command(&mut self, cmd: Command) -> CommandAction {
        self.command = cmd;
        self.errors.code &= !protection::WARNING_COM_TIMEOUT;
        self.control.referee.connected = true;
        self.control.referee.use_new_feedback = cmd.use_new_feedback;
        self.power_stage.allow_enable_output = cmd.enable_output;

        if !cmd.enable_output && self.power_stage.output_main_enabled {
            self.driver.disable_main();
            self.power_stage.output_main_enabled = false;
        }
        if cmd.restart {
            self.driver.disable_main();
            self.power_stage.output_main_enabled = false;
            return CommandAction::Restart;
        }
        if cmd.clear_error {
            self.errors.auto_clear();
            self.errors.manual_clear();
        }

        if cmd.enable_active_charging_limit {
            // Command carries an energy fraction; the regulated quantity is
            // voltage, so the setpoint goes with the square root.
            self.control.v_cap_target = (libm::sqrtf(cmd.charge_ratio as f32 / 255.0)
                * config::CAP_MAX_VOLTAGE)
                .clamp(config::CAP_LOW_VOLTAGE, config::CAP_MAX_VOLTAGE);
        } else {
            self.control.v_cap_target = config::CAP_MAX_VOLTAGE;
        }

        let tracking = self.control.limit_factor == LimitFactor::RefereePower
            && self.power_stage.output_main_enabled;
        self.control
            .referee
            .update_target(cmd.power_limit, cmd.energy_buffer, tracking, self.tick);

        CommandAction::None
    }

    /// Hardware comparator fault: drop the output inside the interrupt,
    /// then record what fired for the recovery machinery.
    pub fn on_comparator_fault(&mut self, flags: FaultFlags) {
        if flags.any() {
            self.driver.disable_main();
            self.power_stage.output_main_enabled = false;
        }
        self.errors.on_comparator_fault(flags);
    }

    /// Periodic or button-driven clears. Re-enable happens through the
    /// normal arbitration once the gate opens again.
    pub fn auto_clear_error(&mut self) -> bool {
        self.errors.auto_clear()
    }

    pub fn manual_clear_error(&mut self) -> bool {
        self.errors.manual_clear()
    }

    fn build_status_frame(&self) -> Frame {
        // With the aux group running, its contribution is folded out of the
        // chassis figure so upstream sees converter throughput only.
        let p_chassis = if self.power_stage.output_aux_enabled {
            self.samples.p_chassis_lf - self.samples.p_aux_lf
        } else {
            self.samples.p_chassis_lf
        };

        StatusView {
            output_enabled: self.power_stage.output_main_enabled,
            use_new_feedback: self.control.referee.use_new_feedback,
            charge_status: self.aux.status,
            limit_factor: self.control.limit_factor,
            severity: self.errors.severity,
            p_chassis_lf: p_chassis,
            p_referee_lf: self.samples.p_referee_lf,
            v_cap_lf: self.samples.v_cap_lf,
            power_limit_feedback: capbank::max_power_feedback(self.samples.v_cap_lf)
                .saturating_add(self.command.power_limit),
        }
        .encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use power_stage::driver::mock::MockDriver;
    use protection::Severity;

    fn controller() -> PowerController<MockDriver> {
        let mut c = PowerController::new(MockDriver::default());
        c.samples.v_primary = 24.0;
        c.samples.v_secondary = 20.0;
        c.samples.v_cap = 20.0;
        c.samples.v_cap_lf = 20.0;
        c
    }

    fn run_slow(c: &mut PowerController<MockDriver>, n: usize) {
        for _ in 0..n {
            c.tick_slow();
        }
    }

    #[test]
    fn uvlo_disables_same_tick_and_reenables_after_recovery() {
        let mut c = controller();
        run_slow(&mut c, 1);
        assert!(c.power_stage.output_main_enabled);

        c.samples.v_primary = config::UVLO_LIMIT - 1.0;
        c.tick_slow();
        assert!(!c.power_stage.output_main_enabled);
        assert_eq!(c.power_stage.soft_start_cnt, config::SOFT_START_TIME);

        // Still below the release threshold: stays off.
        c.samples.v_primary = 19.0;
        run_slow(&mut c, 4);
        assert!(!c.power_stage.output_main_enabled);

        c.samples.v_primary = config::UVLO_RECOVERY + 0.5;
        assert!(c.errors.severity <= Severity::Warning);
        c.tick_slow();
        assert!(c.power_stage.output_main_enabled);
    }

    #[test]
    fn disabled_output_forces_idle_bias_and_resets_the_loop() {
        let mut c = controller();
        let raw = [0u16; analog::CHANNEL_COUNT * config::OVERSAMPLE];
        c.power_stage.il_target = 10.0;
        c.tick_fast(&raw);
        assert_eq!(c.power_stage.il_target, config::IDLE_CURRENT_TARGET);
        assert_eq!(c.control.delta_il, 0.0);
    }

    /// Raw code that calibrates back to `value` on the given channel.
    fn code_for(cal: &calibration::ChannelCal, value: f32) -> u16 {
        ((value - cal.offset) / cal.gain / config::OVERSAMPLE as f32) as u16
    }

    fn raw_frame(values: [f32; 5]) -> analog::RawFrame {
        let cal = calibration::table();
        let codes = [
            code_for(&cal.i_primary, values[0]),
            code_for(&cal.i_secondary, values[1]),
            code_for(&cal.i_reference, values[2]),
            code_for(&cal.v_primary, values[3]),
            code_for(&cal.v_secondary, values[4]),
            0,
            0,
        ];
        let mut raw = [0u16; analog::CHANNEL_COUNT * config::OVERSAMPLE];
        for sweep in 0..config::OVERSAMPLE {
            for ch in 0..analog::CHANNEL_COUNT {
                raw[sweep * analog::CHANNEL_COUNT + ch] = codes[ch];
            }
        }
        raw
    }

    #[test]
    fn short_circuit_latch_drops_output_and_needs_manual_clear() {
        let mut c = controller();
        run_slow(&mut c, 1);
        assert!(c.power_stage.output_main_enabled);
        // Let the soft start elapse so the loop is in a defined regime.
        run_slow(&mut c, config::SOFT_START_TIME as usize);

        // Primary bus collapsed with heavy reverse current: the filters are
        // pre-settled at the fault point so every tick qualifies.
        let raw = raw_frame([-10.0, 0.0, 0.0, 1.0, 24.0]);
        c.samples.v_primary = 1.0;
        c.samples.i_primary = -10.0;
        c.samples.v_secondary = 24.0;
        c.samples.i_secondary = 0.0;
        for _ in 0..3 {
            c.tick_fast(&raw);
        }
        assert!(!c.power_stage.output_main_enabled);
        assert_eq!(c.errors.severity, Severity::RecoverManual);

        // Arbitration must not re-enable while the latch stands; the
        // primary bus is healthy, only the error gate holds it off.
        c.samples.v_primary = 24.0;
        run_slow(&mut c, 4);
        assert!(!c.power_stage.output_main_enabled);

        c.manual_clear_error();
        run_slow(&mut c, 1);
        assert!(c.power_stage.output_main_enabled);
    }

    #[test]
    fn restart_command_is_terminal_for_the_tick() {
        let mut c = controller();
        run_slow(&mut c, 1);
        let cmd = Command {
            enable_output: true,
            restart: true,
            ..Command::default()
        };
        assert_eq!(c.on_command(cmd), CommandAction::Restart);
        assert!(!c.power_stage.output_main_enabled);
    }

    #[test]
    fn active_charging_limit_maps_energy_ratio_to_voltage() {
        let mut c = controller();
        let cmd = Command {
            enable_output: true,
            enable_active_charging_limit: true,
            charge_ratio: 128,
            power_limit: 50,
            energy_buffer: 57,
            ..Command::default()
        };
        c.on_command(cmd);
        let expect = libm::sqrtf(128.0 / 255.0) * config::CAP_MAX_VOLTAGE;
        assert!((c.control.v_cap_target - expect).abs() < 1e-4);

        // Disabling the limit restores the full-voltage target.
        let cmd = Command {
            enable_output: true,
            ..Command::default()
        };
        c.on_command(cmd);
        assert_eq!(c.control.v_cap_target, config::CAP_MAX_VOLTAGE);
    }

    #[test]
    fn comparator_fault_disables_and_auto_recovers() {
        let mut c = controller();
        run_slow(&mut c, 1);
        assert!(c.power_stage.output_main_enabled);

        c.on_comparator_fault(FaultFlags {
            ocp_secondary: true,
            ..Default::default()
        });
        assert!(!c.power_stage.output_main_enabled);
        assert_eq!(c.errors.severity, Severity::RecoverAuto);

        // Counters drain at the phase-0 cadence: four slow ticks per count.
        run_slow(&mut c, 4 * (config::FAULT_COUNTER_LOAD as usize + 1));
        assert_eq!(c.errors.severity, Severity::NoError);
        assert!(c.power_stage.output_main_enabled);
    }

    #[test]
    fn status_frame_follows_the_selected_format() {
        let mut c = controller();
        run_slow(&mut c, 1); // phase 0
        let out = c.tick_slow(); // phase 1 builds the frame
        let frame = out.status_frame.unwrap();
        assert_eq!(frame.id, telemetry::STATUS_ID_LEGACY);

        c.on_command(Command {
            enable_output: true,
            use_new_feedback: true,
            ..Command::default()
        });
        run_slow(&mut c, 3); // phases 2, 3, 0
        let out = c.tick_slow();
        assert_eq!(out.status_frame.unwrap().id, telemetry::STATUS_ID_NEW);
    }

    #[test]
    fn link_timeout_reverts_to_defaults() {
        let mut c = controller();
        c.on_command(Command {
            enable_output: true,
            power_limit: 120,
            energy_buffer: 57,
            ..Command::default()
        });
        assert!(c.control.referee.connected);

        // Phase 0 advances the tick; phase 1 checks the timeout.
        let mut lost = false;
        for _ in 0..4 * (config::COMMAND_TIMEOUT_TICKS as usize + 2) {
            lost |= c.tick_slow().link_lost;
        }
        assert!(lost);
        assert!(!c.control.referee.connected);
        assert_eq!(c.control.referee.p_target, config::REFEREE_DEFAULT_POWER);
    }

    #[test]
    fn identity_mismatch_is_unrecoverable_and_blocks_enable() {
        let mut c = controller();
        assert!(!c.verify_hardware_identity(&[1, 2, 3]));
        assert_eq!(c.errors.severity, Severity::Unrecoverable);
        run_slow(&mut c, 8);
        assert!(!c.power_stage.output_main_enabled);
    }
}
