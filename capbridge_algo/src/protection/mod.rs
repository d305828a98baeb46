// Layered electrical protection and the error/recovery state machine.
// Detectors only ever raise the severity; lowering happens exclusively
// through the three clear operations, each scoped to the class it may clear:
// auto-clear for comparator trips, manual-clear for latched short circuits,
// and the sustained power-off escape for everything else.

use crate::analog::SampleState;
use crate::config;
use crate::power_stage::PowerStageState;

/*-------- Error code bits --------*/

// ERROR_UNRECOVERABLE class
pub const ERROR_POWERSTAGE: u16 = 1 << 0;
pub const ERROR_CAPBANK: u16 = 1 << 1;
// ERROR_RECOVER_MANUAL class
pub const ERROR_SCP_PRIMARY: u16 = 1 << 2;
pub const ERROR_SCP_SECONDARY: u16 = 1 << 3;
// ERROR_RECOVER_AUTO class
pub const ERROR_OCP_PRIMARY: u16 = 1 << 4;
pub const ERROR_OCP_SECONDARY: u16 = 1 << 5;
pub const ERROR_OCP_REFERENCE: u16 = 1 << 6;
pub const ERROR_OVP_PRIMARY: u16 = 1 << 7;
pub const ERROR_OVP_SECONDARY: u16 = 1 << 8;
// WARNING class
pub const WARNING_LOW_BATTERY: u16 = 1 << 9;
pub const WARNING_COM_TIMEOUT: u16 = 1 << 11;

/// Overall error class. Declaration order is the precedence order: a
/// detector may move the state down this list but never up, so deriving
/// `Ord` gives `raise` its semantics for free.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, defmt::Format)]
pub enum Severity {
    NoError,
    Warning,
    RecoverAuto,
    RecoverManual,
    Unrecoverable,
}

impl Severity {
    /// Two-bit severity code used in the status frame. The legacy encoding
    /// folds WARNING onto NO_ERROR: warnings do not gate output, and the
    /// upstream side only reacts to the recoverable classes.
    pub fn wire_code(self) -> u8 {
        match self {
            Severity::NoError | Severity::Warning => 0,
            Severity::RecoverAuto => 1,
            Severity::RecoverManual => 2,
            Severity::Unrecoverable => 3,
        }
    }
}

/// Hardware comparator trip flags, captured by the fault interrupt.
#[derive(Clone, Copy, Default, defmt::Format)]
pub struct FaultFlags {
    pub ovp_primary: bool,
    pub ovp_secondary: bool,
    pub ocp_primary: bool,
    pub ocp_secondary: bool,
    pub ocp_reference: bool,
}

impl FaultFlags {
    pub fn any(&self) -> bool {
        self.ovp_primary
            || self.ovp_secondary
            || self.ocp_primary
            || self.ocp_secondary
            || self.ocp_reference
    }
}

/// Protection status record. The fast tick feeds the short-circuit
/// accumulator; the slow tick owns the decay fields and the escape counter.
pub struct ErrorState {
    pub code: u16,
    pub severity: Severity,

    pub short_circuit_cnt: u16,
    pub over_voltage_cnt: u16,
    pub over_current_cnt: u16,

    pub low_battery: bool,
    low_battery_cnt: u16,
    power_off_cnt: u32,

    /// Operating point latched at the moment a short-circuit trip fired.
    pub fault_voltage: f32,
    pub fault_current: f32,
}

impl ErrorState {
    pub const fn new() -> Self {
        Self {
            code: 0,
            severity: Severity::NoError,
            short_circuit_cnt: 0,
            over_voltage_cnt: 0,
            over_current_cnt: 0,
            low_battery: false,
            low_battery_cnt: 0,
            power_off_cnt: 0,
            fault_voltage: 0.0,
            fault_current: 0.0,
        }
    }

    #[inline(always)]
    pub fn raise(&mut self, to: Severity) {
        if to > self.severity {
            self.severity = to;
        }
    }

    /// Short-circuit accumulation, run immediately after every sample update
    /// while output is enabled. The primary side charges the accumulator
    /// twice as fast: a referee-bus short is fed by the battery and must
    /// latch sooner. Returns true when the latch fired and output must drop
    /// within this tick.
    pub fn check_short_circuit(&mut self, s: &SampleState) -> bool {
        let mut trip = false;

        if s.v_primary <= config::SCP_VOLTAGE && -s.i_primary >= config::SCP_CURRENT {
            self.raise(Severity::Warning);
            self.short_circuit_cnt = self
                .short_circuit_cnt
                .saturating_add(config::SCP_STEP_PRIMARY);
            if self.short_circuit_cnt > config::SCP_TRIP_LEVEL {
                self.code |= ERROR_SCP_PRIMARY;
                self.raise(Severity::RecoverManual);
                self.fault_voltage = s.v_primary;
                self.fault_current = -s.i_primary;
                trip = true;
            }
        }

        if s.v_secondary <= config::SCP_VOLTAGE && s.i_secondary >= config::SCP_CURRENT {
            self.raise(Severity::Warning);
            self.short_circuit_cnt = self
                .short_circuit_cnt
                .saturating_add(config::SCP_STEP_SECONDARY);
            if self.short_circuit_cnt > config::SCP_TRIP_LEVEL {
                self.code |= ERROR_SCP_SECONDARY;
                self.raise(Severity::RecoverManual);
                self.fault_voltage = s.v_secondary;
                self.fault_current = s.i_secondary;
                trip = true;
            }
        }

        trip
    }

    /// Applies hardware comparator trips. The caller has already dropped the
    /// output; this records what fired and loads the decay counters that
    /// time the automatic recovery.
    pub fn on_comparator_fault(&mut self, flags: FaultFlags) {
        if flags.ovp_primary {
            self.code |= ERROR_OVP_PRIMARY;
            self.over_voltage_cnt = config::FAULT_COUNTER_LOAD;
        }
        if flags.ovp_secondary {
            self.code |= ERROR_OVP_SECONDARY;
            self.over_voltage_cnt = config::FAULT_COUNTER_LOAD;
        }
        if flags.ocp_primary {
            self.code |= ERROR_OCP_PRIMARY;
            self.over_current_cnt = config::FAULT_COUNTER_LOAD;
        }
        if flags.ocp_secondary {
            self.code |= ERROR_OCP_SECONDARY;
            self.over_current_cnt = config::FAULT_COUNTER_LOAD;
        }
        if flags.ocp_reference {
            self.code |= ERROR_OCP_REFERENCE;
            self.over_current_cnt = config::FAULT_COUNTER_LOAD;
        }
        if flags.any() {
            self.raise(Severity::RecoverAuto);
        }
    }

    /// Low-battery hysteresis, slow phase 3. The warning needs sustained
    /// undervoltage to latch but clears immediately on recovery, or below
    /// UVLO where the lockout takes over anyway.
    pub fn check_low_battery(&mut self, v_primary: f32) {
        if self.low_battery {
            if v_primary > config::BATTERY_LOW_RECOVERY || v_primary < config::UVLO_LIMIT {
                self.low_battery = false;
                self.code &= !WARNING_LOW_BATTERY;
                if self.code == 0 && self.severity == Severity::Warning {
                    self.severity = Severity::NoError;
                }
            }
        } else if v_primary < config::BATTERY_LOW_LIMIT && v_primary > config::UVLO_RECOVERY {
            self.low_battery_cnt += 1;
            if self.low_battery_cnt > config::BATTERY_LOW_PERSISTENCE {
                self.raise(Severity::Warning);
                self.low_battery = true;
                self.code |= WARNING_LOW_BATTERY;
                self.low_battery_cnt = 0;
            }
        } else {
            self.low_battery_cnt = 0;
        }
    }

    /// Slow phase 0: counter decay and the power-off escape hatch.
    pub fn decay(&mut self, v_primary: f32) {
        match self.severity {
            Severity::Warning => {
                if self.over_current_cnt > 0 {
                    self.over_current_cnt -= 1;
                }
                if self.over_voltage_cnt > 0 {
                    self.over_voltage_cnt -= 1;
                }
                if self.short_circuit_cnt > 0 {
                    self.short_circuit_cnt -= 1;
                }
                if self.over_current_cnt == 0
                    && self.over_voltage_cnt == 0
                    && self.short_circuit_cnt == 0
                    && !self.low_battery
                {
                    self.severity = Severity::NoError;
                }
            }
            Severity::RecoverAuto => {
                if self.over_current_cnt > 0 {
                    self.over_current_cnt -= 1;
                }
                if self.over_voltage_cnt > 0 {
                    self.over_voltage_cnt -= 1;
                }
                if self.over_current_cnt == 0 && self.over_voltage_cnt == 0 {
                    self.auto_clear();
                }
            }
            _ => {}
        }

        // A converter that has genuinely lost its supply for this long is
        // powered down, not faulted: release every latch so the next
        // power-up starts clean. This is the only exit from UNRECOVERABLE.
        if v_primary < config::UVLO_LIMIT {
            self.power_off_cnt = self.power_off_cnt.saturating_add(1);
        } else {
            self.power_off_cnt = 0;
        }
        if self.power_off_cnt > config::POWER_OFF_ESCAPE_TICKS && self.severity != Severity::NoError
        {
            self.force_clear();
        }
    }

    /// Clears the auto-recoverable class. No effect on any other class.
    pub fn auto_clear(&mut self) -> bool {
        if self.severity != Severity::RecoverAuto {
            return false;
        }
        self.code = 0;
        self.over_current_cnt = 0;
        self.over_voltage_cnt = 0;
        self.severity = Severity::NoError;
        true
    }

    /// Clears the manually-recoverable class (button or bus command).
    pub fn manual_clear(&mut self) -> bool {
        if self.severity != Severity::RecoverManual {
            return false;
        }
        self.code = 0;
        self.short_circuit_cnt = 0;
        self.severity = Severity::NoError;
        true
    }

    fn force_clear(&mut self) {
        self.code = 0;
        self.short_circuit_cnt = 0;
        self.over_current_cnt = 0;
        self.over_voltage_cnt = 0;
        self.low_battery = false;
        self.low_battery_cnt = 0;
        self.severity = Severity::NoError;
    }

    /// Structural fault: this binary's calibration table does not belong to
    /// the power stage it is running on.
    pub fn mark_identity_fault(&mut self) {
        self.code |= ERROR_POWERSTAGE;
        self.raise(Severity::Unrecoverable);
    }

    /// Whether the output-enable arbitration may turn the stage back on.
    pub fn output_permitted(&self) -> bool {
        self.severity <= Severity::Warning
    }
}

/// Conversion efficiency by power direction, computed while meaningful
/// primary current flows. Diagnostic only: nothing gates on it.
pub fn update_efficiency(ps: &mut PowerStageState, s: &SampleState) {
    if s.i_primary > 0.5 {
        ps.efficiency = (s.v_secondary * s.i_secondary) / (s.v_primary * s.i_primary);
    } else if s.i_primary < -0.5 {
        ps.efficiency = (s.v_primary * s.i_primary) / (s.v_secondary * s.i_secondary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shorted_primary() -> SampleState {
        let mut s = SampleState::new();
        s.v_primary = 1.0;
        s.i_primary = -10.0;
        s.v_secondary = 24.0;
        s.i_secondary = 0.0;
        s
    }

    #[test]
    fn continuous_short_trips_in_bounded_ticks() {
        let mut e = ErrorState::new();
        let s = shorted_primary();

        assert!(!e.check_short_circuit(&s));
        assert_eq!(e.severity, Severity::Warning);
        assert!(!e.check_short_circuit(&s));
        // 600 + 600 + 600 crosses the 1700 trip level on the third tick.
        assert!(e.check_short_circuit(&s));
        assert_eq!(e.severity, Severity::RecoverManual);
        assert_ne!(e.code & ERROR_SCP_PRIMARY, 0);
        assert_eq!(e.fault_current, 10.0);
    }

    #[test]
    fn isolated_trips_with_decay_between_never_latch() {
        let mut e = ErrorState::new();
        let s = shorted_primary();

        for _ in 0..3 {
            e.check_short_circuit(&s);
            // Enough quiet slow ticks to drain the 600 the trip added.
            for _ in 0..600 {
                e.decay(24.0);
            }
            assert_eq!(e.short_circuit_cnt, 0);
            assert_eq!(e.severity, Severity::NoError);
        }
        assert_eq!(e.code & (ERROR_SCP_PRIMARY | ERROR_SCP_SECONDARY), 0);
    }

    #[test]
    fn secondary_side_accumulates_slower() {
        let mut e = ErrorState::new();
        let mut s = SampleState::new();
        s.v_primary = 24.0;
        s.v_secondary = 0.5;
        s.i_secondary = 8.0;

        let mut ticks = 0;
        while !e.check_short_circuit(&s) {
            ticks += 1;
            assert!(ticks < 10);
        }
        // 300 per tick: the sixth tick crosses 1700.
        assert_eq!(ticks, 5);
        assert_ne!(e.code & ERROR_SCP_SECONDARY, 0);
    }

    #[test]
    fn comparator_fault_auto_recovers_after_decay() {
        let mut e = ErrorState::new();
        e.on_comparator_fault(FaultFlags {
            ovp_primary: true,
            ..Default::default()
        });
        assert_eq!(e.severity, Severity::RecoverAuto);
        assert_ne!(e.code & ERROR_OVP_PRIMARY, 0);

        for _ in 0..1000 {
            e.decay(24.0);
        }
        assert_eq!(e.severity, Severity::NoError);
        assert_eq!(e.code, 0);
        assert!(e.output_permitted());
    }

    #[test]
    fn low_battery_needs_persistence_and_clears_on_recovery() {
        let mut e = ErrorState::new();
        for _ in 0..1000 {
            e.check_low_battery(20.5);
        }
        assert!(!e.low_battery);
        e.check_low_battery(20.5);
        assert!(e.low_battery);
        assert_eq!(e.severity, Severity::Warning);

        // A single good sample resets the debounce...
        let mut e2 = ErrorState::new();
        for _ in 0..900 {
            e2.check_low_battery(20.5);
        }
        e2.check_low_battery(22.0);
        for _ in 0..900 {
            e2.check_low_battery(20.5);
        }
        assert!(!e2.low_battery);

        // ...and recovery above the release threshold clears the warning.
        e.check_low_battery(21.7);
        assert!(!e.low_battery);
        assert_eq!(e.severity, Severity::NoError);
    }

    #[test]
    fn manual_class_ignores_auto_clear() {
        let mut e = ErrorState::new();
        let s = shorted_primary();
        for _ in 0..3 {
            e.check_short_circuit(&s);
        }
        assert_eq!(e.severity, Severity::RecoverManual);
        assert!(!e.auto_clear());
        assert_eq!(e.severity, Severity::RecoverManual);
        assert!(e.manual_clear());
        assert_eq!(e.severity, Severity::NoError);
        assert_eq!(e.short_circuit_cnt, 0);
    }

    #[test]
    fn power_off_escape_releases_unrecoverable() {
        let mut e = ErrorState::new();
        e.mark_identity_fault();
        assert_eq!(e.severity, Severity::Unrecoverable);
        assert!(!e.auto_clear());
        assert!(!e.manual_clear());

        for _ in 0..2002 {
            e.decay(10.0);
        }
        assert_eq!(e.severity, Severity::NoError);
        assert_eq!(e.code, 0);
    }

    #[test]
    fn detectors_never_lower_severity() {
        let mut e = ErrorState::new();
        e.mark_identity_fault();
        e.raise(Severity::Warning);
        assert_eq!(e.severity, Severity::Unrecoverable);
        e.on_comparator_fault(FaultFlags {
            ocp_primary: true,
            ..Default::default()
        });
        assert_eq!(e.severity, Severity::Unrecoverable);
    }
}
