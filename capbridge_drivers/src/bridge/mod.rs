// Bridge power-stage driver: two advanced-control timers carry the converter
// legs (TIM1 primary, TIM8 secondary plus the auxiliary group on its second
// channel), and DAC1 provides the peak/valley current references for the
// current-mode comparators. This is the translation layer behind the control
// core's `PowerStageDriver` trait; all policy stays on the other side of it.

use capbridge_algo::power_stage::driver::{Leg, PowerStageDriver};

use hal::{
    clocks::Clocks,
    dac::{Dac, DacBits, DacChannel},
    pac::{DAC1, TIM1, TIM8},
    timer::{
        Alignment, CountDir, OutputCompare, TimChannel, Timer, TimerConfig, TimerInterrupt,
        UpdateReqSrc,
    },
};

use super::pinout;

/// Current-sense scaling: amps -> DAC code around the mid-rail offset.
const RSENSE: f32 = 0.002;
const IAMP_GAIN: f32 = 20.0;
const DAC_VREF: f32 = 2.9;
const DAC_MID: f32 = 2048.0;
/// Peak/valley references sit half the ripple above/below the target.
const RIPPLE_HALF: f32 = 1.25;

fn current_to_code(amps: f32) -> u16 {
    (amps * (RSENSE * IAMP_GAIN * 4096.0 / DAC_VREF) + DAC_MID).clamp(0.0, 4095.0) as u16
}

pub struct BridgeDriver {
    tim_primary: Timer<TIM1>,
    tim_secondary: Timer<TIM8>,
    dac: Dac<DAC1>,
    running: bool,
}

impl BridgeDriver {
    pub fn new(
        tim1: TIM1,
        tim8: TIM8,
        dac1: DAC1,
        clock_cfg: &Clocks,
        switching_freq: f32,
    ) -> Self {
        let cfg = || TimerConfig {
            one_pulse_mode: false,
            update_request_source: UpdateReqSrc::Any,
            auto_reload_preload: true,
            alignment: Alignment::Center1,
            direction: CountDir::Up,
            ..Default::default()
        };
        let tim_primary = Timer::new_tim1(tim1, switching_freq, cfg(), clock_cfg);
        let tim_secondary = Timer::new_tim8(tim8, switching_freq, cfg(), clock_cfg);

        let mut dac = Dac::new(dac1, DacBits::TwelveR, DAC_VREF);
        dac.enable(DacChannel::C1);
        dac.enable(DacChannel::C2);

        pinout::bridge::GATE_PRI_H.init();
        pinout::bridge::GATE_PRI_L.init();
        pinout::bridge::GATE_SEC_H.init();
        pinout::bridge::GATE_SEC_L.init();
        pinout::bridge::GATE_AUX.init();
        let mut enable = pinout::bridge::GATE_ENABLE.init();
        enable.set_high();

        Self {
            tim_primary,
            tim_secondary,
            dac,
            running: false,
        }
    }

    /// Starts the switching timers and the fast-tick interrupt source. Gate
    /// outputs stay off until `enable_main`.
    pub fn start(&mut self) {
        self.tim_primary
            .enable_pwm_output(TimChannel::C1, OutputCompare::Pwm1, 0.0);
        self.tim_secondary
            .enable_pwm_output(TimChannel::C1, OutputCompare::Pwm1, 0.0);
        self.tim_secondary
            .enable_pwm_output(TimChannel::C2, OutputCompare::Pwm1, 0.0);

        self.tim_primary.enable_interrupt(TimerInterrupt::Update);
        self.tim_secondary.enable();
        self.tim_primary.enable();
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.disable_main();
        self.tim_primary.disable();
        self.tim_secondary.disable();
        self.running = false;
    }

    /// Clears the fast-tick interrupt flag; called first thing in the ISR.
    pub fn clear_tick_interrupt(&mut self) {
        self.tim_primary.clear_interrupt(TimerInterrupt::Update);
    }

    /// Clears the break flag after a comparator trip. The break input has
    /// already forced the gates off in hardware; software only acknowledges.
    pub fn acknowledge_fault(&mut self) {
        self.tim_primary.regs.sr.modify(|_, w| w.bif().clear_bit());
        self.tim_secondary.regs.sr.modify(|_, w| w.bif().clear_bit());
    }
}

// The two window compare channels bound each leg's conduction window: C4
// carries the low fraction, C3 the high one, scaled to the timer period.
impl PowerStageDriver for BridgeDriver {
    fn set_leg_duty_limit(&mut self, leg: Leg, low: f32, high: f32) {
        match leg {
            Leg::Primary => {
                let period = self.tim_primary.get_max_duty();
                self.tim_primary
                    .set_duty(TimChannel::C4, (period as f32 * low) as u32);
                self.tim_primary
                    .set_duty(TimChannel::C3, (period as f32 * high) as u32);
            }
            Leg::Secondary => {
                let period = self.tim_secondary.get_max_duty();
                self.tim_secondary
                    .set_duty(TimChannel::C4, (period as f32 * low) as u32);
                self.tim_secondary
                    .set_duty(TimChannel::C3, (period as f32 * high) as u32);
            }
        }
    }

    fn hold_leg_on(&mut self, leg: Leg) {
        match leg {
            Leg::Primary => self.tim_primary.set_duty(TimChannel::C3, 0),
            Leg::Secondary => self.tim_secondary.set_duty(TimChannel::C3, 0),
        }
    }

    fn enable_main(&mut self) -> bool {
        if !self.running {
            return false;
        }
        // Master output enable on both leg timers.
        self.tim_primary.regs.bdtr.modify(|_, w| w.moe().set_bit());
        self.tim_secondary.regs.bdtr.modify(|_, w| w.moe().set_bit());
        true
    }

    fn disable_main(&mut self) {
        self.tim_primary.regs.bdtr.modify(|_, w| w.moe().clear_bit());
        self.tim_secondary
            .regs
            .bdtr
            .modify(|_, w| w.moe().clear_bit());
    }

    fn enable_aux(&mut self, duty: f32) -> bool {
        if !self.running {
            return false;
        }
        self.set_aux_duty(duty);
        true
    }

    fn disable_aux(&mut self) {
        self.tim_secondary.set_duty(TimChannel::C2, 0);
    }

    fn set_aux_duty(&mut self, duty: f32) {
        let period = self.tim_secondary.get_max_duty();
        self.tim_secondary
            .set_duty(TimChannel::C2, (period as f32 * duty) as u32);
    }

    fn set_current_reference(&mut self, amps: f32) {
        // Peak reference above the target, valley reference mirrored below.
        self.dac
            .write(DacChannel::C2, current_to_code(amps - RIPPLE_HALF));
        self.dac
            .write(DacChannel::C1, current_to_code(-(amps + RIPPLE_HALF)));
    }
}
