// PWM buzzer. Notes are scheduled against the housekeeping tick counter;
// the stop comparison is wraparound-safe (signed difference) so a note
// queued near the counter wrap still ends on time.

use hal::{
    clocks::Clocks,
    pac::TIM3,
    timer::{OutputCompare, TimChannel, Timer, TimerConfig},
};

use super::pinout;

pub struct Buzzer {
    tim: Timer<TIM3>,
    stop_at: u32,
}

impl Buzzer {
    pub fn new(tim3: TIM3, clock_cfg: &Clocks) -> Self {
        pinout::interface::BUZZER.init();
        let mut tim = Timer::new_tim3(tim3, 1000.0, TimerConfig::default(), clock_cfg);
        tim.enable_pwm_output(TimChannel::C1, OutputCompare::Pwm1, 0.0);
        tim.enable();
        Self { tim, stop_at: 0 }
    }

    /// Starts a note at `freq` Hz for `duration` housekeeping ticks.
    pub fn play(&mut self, freq: u16, duration: u32, now: u32) {
        if freq == 0 {
            self.stop();
            return;
        }
        let _ = self.tim.set_freq(freq as f32);
        let half = self.tim.get_max_duty() / 2;
        self.tim.set_duty(TimChannel::C1, half);
        self.stop_at = now.wrapping_add(duration);
    }

    /// Silences the output once the scheduled duration has elapsed.
    pub fn update(&mut self, now: u32) {
        if now.wrapping_sub(self.stop_at) as i32 >= 0 {
            self.stop();
        }
    }

    pub fn stop(&mut self) {
        self.tim.set_duty(TimChannel::C1, 0);
    }
}
