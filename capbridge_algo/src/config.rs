// Tuned configuration for the converter control core. Values here are the
// board-level tuning surface: protection thresholds, loop gains, topology
// hysteresis bands and the telemetry defaults. Hardware-specific ADC scaling
// lives in `calibration`.

use crate::power_stage::TopologyBands;

/*-------- Tick rates --------*/

/// Fast control tick, driven by the power-stage timer repetition event.
pub const FAST_TICK_HZ: u32 = 17_000;
/// Housekeeping timer tick. Each round-robin phase runs at a quarter of this.
pub const SLOW_TICK_HZ: u32 = 4_000;
/// Raw codes consumed per fast tick and channel.
pub const OVERSAMPLE: usize = 4;

/// ADC reference (VREFBUF).
pub const ADC_VREF: f32 = 2.9;

/*-------- Filtering --------*/

/// Fast IIR coefficient for current channels.
pub const ISENSE_ALPHA: f32 = 0.8;
/// Fast IIR coefficient for voltage channels.
pub const VSENSE_ALPHA: f32 = 0.8;
/// Second-stage coefficient producing the low-frequency telemetry signals
/// (~1.5 kHz pole at the fast tick rate).
pub const FAST_TO_LF_ALPHA: f32 = 0.092;
/// Averaging coefficient for the offline calibration readout.
pub const CAL_AVG_ALPHA: f32 = 0.001;

/*-------- Protection --------*/

/// Short-circuit qualification: bus voltage at or below this...
pub const SCP_VOLTAGE: f32 = 5.0;
/// ...while reverse current is at or above this.
pub const SCP_CURRENT: f32 = 5.0;
/// Accumulator trip level for the manually-recoverable short-circuit latch.
pub const SCP_TRIP_LEVEL: u16 = 1700;
/// Accumulator increment per qualifying fast tick, primary side.
pub const SCP_STEP_PRIMARY: u16 = 600;
/// Accumulator increment per qualifying fast tick, secondary side.
pub const SCP_STEP_SECONDARY: u16 = 300;

/// Decay load placed on the over-voltage/over-current counters by a
/// comparator trip; the fault auto-clears once the counter drains (~1 s).
pub const FAULT_COUNTER_LOAD: u16 = 1000;

/// Primary-bus undervoltage lockout and its release threshold.
pub const UVLO_LIMIT: f32 = 18.0;
pub const UVLO_RECOVERY: f32 = 20.0;

/// Low-battery warning band, debounced against switching transients.
pub const BATTERY_LOW_LIMIT: f32 = 20.92;
pub const BATTERY_LOW_RECOVERY: f32 = 21.6;
/// Slow-phase ticks below the limit before the warning latches (~1 s).
pub const BATTERY_LOW_PERSISTENCE: u16 = 1000;

/// Slow-phase ticks of sustained primary undervoltage that force every error
/// class clear (~2 s of genuine power-off).
pub const POWER_OFF_ESCAPE_TICKS: u32 = 2000;

/// Inductor current hard limit, either direction.
pub const MAX_INDUCTOR_CURRENT: f32 = 25.0;
/// Soft-start countdown loaded on every output enable (slow ticks).
pub const SOFT_START_TIME: u8 = 8;
/// Inductor current commanded while the output stage is disabled.
pub const IDLE_CURRENT_TARGET: f32 = -2.0;

/*-------- Upstream power source --------*/

/// Power target used when no upstream command has arrived.
pub const REFEREE_DEFAULT_POWER: f32 = 37.0;
/// Energy-buffer setpoint for the bias loop (J).
pub const REFEREE_ENERGY_BUFFER: f32 = 57.0;
/// Symmetric clamp on the bias-loop correction (W).
pub const REFEREE_POWER_BIAS_LIMIT: f32 = 15.0;
/// Absolute band for the effective power target (W).
pub const REFEREE_POWER_MIN: f32 = 5.0;
pub const REFEREE_POWER_MAX: f32 = 135.0;
/// Ticks without a valid command frame before the link counts as lost.
pub const COMMAND_TIMEOUT_TICKS: u32 = 500;
/// Fallback power fed to the current loop while charging is held off (W).
pub const CHARGE_HOLDOFF_POWER: f32 = 6.0;

/*-------- Supercapacitor bank --------*/

/// Nominal bank capacitance and the plausibility band for the estimator (F).
pub const CAP_DEFAULT_CAPACITY: f32 = 4.4;
pub const CAP_CAPACITY_HIGH: f32 = 10.0;
pub const CAP_CAPACITY_LOW: f32 = 0.2;
/// Series resistance compensated out of the sensed bank voltage.
pub const CAP_DCR: f32 = 0.1;
/// Current-limit taper knee points.
pub const CAP_CUTOFF_VOLTAGE: f32 = 5.0;
pub const CAP_LOW_VOLTAGE: f32 = 10.0;
pub const CAP_MAX_VOLTAGE: f32 = 28.8;
pub const CAP_MAX_CURRENT: f32 = 15.0;

/// Loop gains for the cascaded current/power loop.
pub const IR_PID_GAINS: (f32, f32, f32, f32) = (0.1, 0.2, 0.10, 0.01);
pub const CURRENT_LIMIT_KI: f32 = 0.8;
pub const VOLTAGE_LIMIT_KI: f32 = 0.01;

/*-------- Capacity estimator --------*/

/// Voltage excursion that triggers a charge-per-volt evaluation.
pub const CAP_EST_DELTA_V: f32 = 0.7;
/// Accumulated charge that triggers a volt-per-charge evaluation (A·tick).
pub const CAP_EST_DELTA_Q: f32 = 600.0;
/// Idle ticks with neither trigger before the window restarts.
pub const CAP_EST_TIMEOUT_TICKS: u32 = 1000;
/// Current ripple envelope above which a window is discarded as untrusted.
pub const CAP_EST_MAX_RIPPLE: f32 = 4.5;
/// Anomaly counter: increments for the two evaluation kinds, alert level.
pub const CAP_EST_ANOMALY_STEP_V: u16 = 9;
pub const CAP_EST_ANOMALY_STEP_Q: u16 = 4;
pub const CAP_EST_ALERT_LEVEL: u16 = 15;

/*-------- Power stage --------*/

/// Secondary-bus voltage implied at 100 % duty, used to tighten the
/// secondary-leg bound as the bank approaches its rating.
pub const VSEC_LIMIT_BY_DUTY: f32 = 29.8;
/// Same limit for the auxiliary charger output group.
pub const VAUX_LIMIT_BY_DUTY: f32 = 30.8;

/// Topology hysteresis bands (voltage-ratio thresholds). Asymmetric on
/// purpose: each boundary is crossed at a different ratio in each direction
/// so dither around a threshold cannot chatter between modes.
pub const TOPOLOGY_BANDS: TopologyBands = TopologyBands {
    buck_up: 0.84,
    buckboost_down: 0.80,
    buckboost_up: 1.02,
    boostbuck_down: 0.82,
    boostbuck_mid: 0.98,
    boostbuck_up: 1.25,
    boost_down: 0.82,
    boost_mid: 1.19,
};

/// Leg duty windows per mode, as conduction-window fractions handed to the
/// power-stage driver. `LIMIT_*` bound a regulating leg, `FIXED_WINDOW` pins
/// the intermediate leg of the pass-through modes.
pub const DUTY_LIMIT_LOW: f32 = 0.06;
pub const DUTY_LIMIT_HIGH_BUCK: f32 = 0.998;
pub const DUTY_LIMIT_HIGH: f32 = 0.95;
pub const DUTY_FIXED_WINDOW: (f32, f32) = (0.16, 0.24);
pub const DUTY_SECONDARY_BOUND: f32 = 0.75;
pub const DUTY_CAL_PRIMARY_WINDOW: (f32, f32) = (0.20, 0.35);
pub const DUTY_CAL_SECONDARY_WINDOW: (f32, f32) = (0.20, 0.50);
/// Intermediate-leg transfer ratio implied by `DUTY_FIXED_WINDOW`.
pub const DUTY_FIXED_RATIO: f32 = 0.84;

/*-------- Auxiliary charger --------*/

/// Whether the auxiliary (wireless) charge receiver is fitted on this board.
pub const AUX_CHARGER_FITTED: bool = false;
/// Receiver voltage regulation point and integrator gain.
pub const AUX_VOLTAGE_TARGET: f32 = 29.5;
pub const AUX_VOLTAGE_KI: f32 = 0.001;
/// Receiver voltage that allows the aux output group to start.
pub const AUX_START_VOLTAGE: f32 = 29.55;
/// LF aux power above which the receiver is shut down as faulted (W).
pub const AUX_POWER_LIMIT: f32 = 145.0;
/// Consecutive low-power slow phases before the aux output drops.
pub const AUX_LOW_POWER_TICKS: u16 = 150;
pub const AUX_LOW_POWER_LEVEL: f32 = 3.0;
