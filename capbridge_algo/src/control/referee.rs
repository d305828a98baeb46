// Power-target tracking against the upstream (referee) energy budget. The
// commanded power limit is the baseline; a bias-limited PI+D loop on the
// reported energy-buffer error nudges the effective target so the buffer
// rides at its setpoint instead of slowly draining under estimation error.

use crate::config;

pub struct RefereeLoop {
    kp: f32,
    ki: f32,
    kd: f32,

    last_error: f32,
    integral: f32,
    /// Latest bias, clamped to `REFEREE_POWER_BIAS_LIMIT`.
    pub bias: f32,

    /// Effective power target consumed by the current loop.
    pub p_target: f32,

    pub connected: bool,
    pub use_new_feedback: bool,
    pub last_rx_tick: u32,
}

impl RefereeLoop {
    pub const fn new() -> Self {
        Self {
            kp: 1.0,
            ki: 0.04,
            kd: 1.5,
            last_error: 0.0,
            integral: 0.0,
            bias: 0.0,
            p_target: config::REFEREE_DEFAULT_POWER,
            connected: false,
            use_new_feedback: false,
            last_rx_tick: 0,
        }
    }

    /// Folds a received command into the effective power target. `tracking`
    /// is true only while the cascaded loop is actually in the
    /// referee-power regime with output enabled; outside that the bias
    /// history is held reset so re-entry starts clean.
    pub fn update_target(&mut self, power_limit: u16, energy_buffer: u16, tracking: bool, tick: u32) {
        if tracking {
            let error = energy_buffer as f32 - config::REFEREE_ENERGY_BUFFER;
            self.bias =
                self.kp * error + self.ki * self.integral + self.kd * (error - self.last_error);
            self.last_error = error;
            self.integral += error;
            self.bias = self.bias.clamp(
                -config::REFEREE_POWER_BIAS_LIMIT,
                config::REFEREE_POWER_BIAS_LIMIT,
            );
        } else {
            self.last_error = 0.0;
            self.integral = 0.0;
        }

        self.p_target = (self.bias + power_limit as f32)
            .clamp(config::REFEREE_POWER_MIN, config::REFEREE_POWER_MAX);
        self.last_rx_tick = tick;
    }

    /// Drops back to the no-link defaults.
    pub fn reset_to_default(&mut self) {
        self.p_target = config::REFEREE_DEFAULT_POWER;
        self.last_error = 0.0;
        self.integral = 0.0;
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn bias_is_clamped_symmetrically() {
        let mut r = RefereeLoop::new();
        // Huge positive buffer error: bias saturates high.
        r.update_target(50, 250, true, 1);
        assert_eq!(r.bias, config::REFEREE_POWER_BIAS_LIMIT);
        assert_eq!(r.p_target, 50.0 + config::REFEREE_POWER_BIAS_LIMIT);

        // Deeply drained buffer: bias saturates low.
        let mut r = RefereeLoop::new();
        r.update_target(50, 0, true, 1);
        assert_eq!(r.bias, -config::REFEREE_POWER_BIAS_LIMIT);
    }

    #[test]
    fn target_respects_absolute_band() {
        let mut r = RefereeLoop::new();
        r.update_target(500, 57, true, 1);
        assert_eq!(r.p_target, config::REFEREE_POWER_MAX);
        r.update_target(0, 57, false, 2);
        assert_eq!(r.p_target, config::REFEREE_POWER_MIN);
    }

    #[test]
    fn history_resets_while_not_tracking() {
        let mut r = RefereeLoop::new();
        r.update_target(50, 100, true, 1);
        assert!(r.integral != 0.0);
        r.update_target(50, 100, false, 2);
        assert_eq!(r.integral, 0.0);
        assert_eq!(r.last_error, 0.0);
    }
}
