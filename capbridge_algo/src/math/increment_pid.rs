// Increment-output controller used by the cascaded current loop. Unlike a
// textbook PID this produces a per-call *delta* built from four terms:
// proportional on the target change, proportional on the measurement change,
// integral on the instantaneous error, and a second-difference derivative
// over the last three error samples. The caller owns the accumulator the
// increments feed into, which is what lets several competing limit terms be
// arbitrated before anything is integrated.

/// Increment controller with independent gains and history.
pub struct IncrementPid {
    k_target_p: f32,
    k_measure_p: f32,
    k_i: f32,
    k_d: f32,

    prev_target: f32,
    prev_measure: f32,
    /// Error two calls back, for the second-difference derivative.
    prev_prev_error: f32,

    delta: f32,
    clamp: Option<(f32, f32)>,
}

impl IncrementPid {
    pub const fn new(k_target_p: f32, k_measure_p: f32, k_i: f32, k_d: f32) -> Self {
        Self {
            k_target_p,
            k_measure_p,
            k_i,
            k_d,
            prev_target: 0.0,
            prev_measure: 0.0,
            prev_prev_error: 0.0,
            delta: 0.0,
            clamp: None,
        }
    }

    pub fn set_gains(&mut self, k_target_p: f32, k_measure_p: f32, k_i: f32, k_d: f32) {
        self.k_target_p = k_target_p;
        self.k_measure_p = k_measure_p;
        self.k_i = k_i;
        self.k_d = k_d;
    }

    /// Clamps every subsequent increment to `[lower, upper]`.
    pub fn set_clamp(&mut self, lower: f32, upper: f32) {
        self.clamp = Some((lower, upper));
    }

    pub fn disable_clamp(&mut self) {
        self.clamp = None;
    }

    /// Computes the next output increment. History updates unconditionally,
    /// before any clamping, so a saturated call still advances the
    /// derivative and proportional references.
    pub fn compute_delta(&mut self, target: f32, measurement: f32) {
        let error = target - measurement;
        let prev_error = self.prev_target - self.prev_measure;

        self.delta = self.k_target_p * (target - self.prev_target)
            + self.k_measure_p * (measurement - self.prev_measure)
            + self.k_i * error
            + self.k_d * (error - 2.0 * prev_error + self.prev_prev_error);

        self.prev_prev_error = prev_error;
        self.prev_target = target;
        self.prev_measure = measurement;

        if let Some((lower, upper)) = self.clamp {
            self.delta = self.delta.clamp(lower, upper);
        }
    }

    pub fn output(&self) -> f32 {
        self.delta
    }

    /// Zeroes history and output. Required whenever the driven loop is
    /// inactive so re-activation does not replay a stale derivative.
    pub fn reset(&mut self) {
        self.delta = 0.0;
        self.prev_target = 0.0;
        self.prev_measure = 0.0;
        self.prev_prev_error = 0.0;
    }
}
