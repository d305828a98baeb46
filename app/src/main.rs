#![no_main]
#![no_std]

use defmt_rtt as _;
use panic_probe as _;

mod interface;

use capbridge_algo::{config, protection, CommandAction, PowerController};
use capbridge_drivers::{
    acquisition::{FastAdc, SlowAdc, RAW_FRAME_LEN},
    bridge::BridgeDriver,
    buzzer::Buzzer,
    can::CanBus,
    pinout,
};

use hal::{
    self,
    clocks::Clocks,
    pac,
    timer::{Timer, TimerConfig, TimerInterrupt},
};

use cortex_m;

/// Raw frame the acquisition DMA fills between fast ticks.
static mut ADC_RAW: [u16; RAW_FRAME_LEN] = [0; RAW_FRAME_LEN];

/// MCU unique-id words, checked against the calibration table.
const UID_BASE: u32 = 0x1FFF_7590;

fn read_hardware_uid() -> [u32; 3] {
    unsafe {
        [
            core::ptr::read_volatile(UID_BASE as *const u32),
            core::ptr::read_volatile((UID_BASE + 4) as *const u32),
            core::ptr::read_volatile((UID_BASE + 8) as *const u32),
        ]
    }
}

fn system_restart() -> ! {
    cortex_m::interrupt::disable();
    cortex_m::peripheral::SCB::sys_reset();
}

#[rtic::app(device = pac, peripherals = true)]
mod app {
    use super::*;
    use crate::interface::{ButtonAction, Interface, StatusSnapshot};

    #[shared]
    struct Shared {
        ctrl: PowerController<BridgeDriver>,
        can: CanBus,
    }

    #[local]
    struct Local {
        fast_adc: FastAdc,
        slow_adc: SlowAdc,
        buzzer: Buzzer,
        ui: Interface,
        slow_tim: Timer<pac::TIM2>,
        fault_pins: [hal::gpio::Pin; 5],
    }

    #[init]
    fn init(ctx: init::Context) -> (Shared, Local) {
        let dp = ctx.device;
        let clock_cfg = Clocks::default();
        clock_cfg.setup().unwrap();
        defmt::info!("capbridge: core clock {} MHz", clock_cfg.sysclk() / 1_000_000);

        let mut driver = BridgeDriver::new(
            dp.TIM1,
            dp.TIM8,
            dp.DAC1,
            &clock_cfg,
            config::FAST_TICK_HZ as f32,
        );

        let mut fast_adc = FastAdc::new(dp.ADC1, &clock_cfg);
        let slow_adc = SlowAdc::new(dp.ADC2, &clock_cfg);
        let can = CanBus::new(dp.FDCAN1);
        let buzzer = Buzzer::new(dp.TIM3, &clock_cfg);
        let ui = Interface::new();

        let fault_pins = [
            pinout::bridge::FAULT_OVP_PRI.init(),
            pinout::bridge::FAULT_OVP_SEC.init(),
            pinout::bridge::FAULT_OCP_PRI.init(),
            pinout::bridge::FAULT_OCP_SEC.init(),
            pinout::bridge::FAULT_OCP_REF.init(),
        ];

        let mut slow_tim = Timer::new_tim2(
            dp.TIM2,
            config::SLOW_TICK_HZ as f32,
            TimerConfig::default(),
            &clock_cfg,
        );
        slow_tim.enable_interrupt(TimerInterrupt::Update);

        driver.start();
        let mut ctrl = PowerController::new(driver);

        let uid = read_hardware_uid();
        if !ctrl.verify_hardware_identity(&uid) {
            defmt::error!("power stage identity mismatch");
        }

        // First frame in flight before the fast interrupt fires.
        unsafe { fast_adc.start_frame(&mut *core::ptr::addr_of_mut!(ADC_RAW)) };
        slow_tim.enable();

        (
            Shared { ctrl, can },
            Local {
                fast_adc,
                slow_adc,
                buzzer,
                ui,
                slow_tim,
                fault_pins,
            },
        )
    }

    /// Fast control tick off the power-stage timer's repetition event:
    /// consume the frame the DMA just finished, then start the next one.
    #[task(binds = TIM1_UP_TIM16, shared = [ctrl], local = [fast_adc], priority = 4)]
    fn fast_tick(mut cx: fast_tick::Context) {
        cx.shared.ctrl.lock(|ctrl| {
            ctrl.driver.clear_tick_interrupt();
            let raw = unsafe { &*core::ptr::addr_of!(ADC_RAW) };
            ctrl.tick_fast(raw);
        });
        unsafe {
            cx.local
                .fast_adc
                .start_frame(&mut *core::ptr::addr_of_mut!(ADC_RAW))
        };
    }

    /// 4 kHz housekeeping: one control-core phase plus the matching
    /// interface work.
    #[task(binds = TIM2, shared = [ctrl, can], local = [slow_adc, buzzer, ui, slow_tim], priority = 2)]
    fn housekeeping(mut cx: housekeeping::Context) {
        cx.local.slow_tim.clear_interrupt(TimerInterrupt::Update);

        let (out, snap) = cx.shared.ctrl.lock(|c| {
            let out = c.tick_slow();
            let snap = StatusSnapshot {
                severity: c.errors.severity,
                error_code: c.errors.code,
                output_enabled: c.power_stage.output_main_enabled,
                connected: c.control.referee.connected,
                charging: c.samples.i_cap > 0.0,
                tick: c.tick_count(),
            };
            (out, snap)
        });

        match out.phase {
            0 => {
                cx.local.buzzer.update(snap.tick);
                cx.local.ui.refresh_leds(&snap);
            }
            1 => {
                if let Some(frame) = out.status_frame {
                    cx.shared.can.lock(|can| can.send(&frame));
                }
                if out.link_lost {
                    defmt::warn!("command link lost, reverting to defaults");
                }
                match cx.local.ui.poll_button() {
                    ButtonAction::ClearError => {
                        cx.shared.ctrl.lock(|c| match c.errors.severity {
                            protection::Severity::RecoverManual => {
                                c.manual_clear_error();
                            }
                            protection::Severity::RecoverAuto => {
                                c.auto_clear_error();
                            }
                            _ => {}
                        });
                    }
                    ButtonAction::Restart => {
                        cx.shared.ctrl.lock(|c| c.driver.disable_main());
                        system_restart();
                    }
                    ButtonAction::None => {}
                }
            }
            2 => {
                let pair = cx.local.slow_adc.read_pair();
                cx.shared.ctrl.lock(|c| c.samples.service_low_rate(&pair));
                if out.capacity_alert {
                    defmt::warn!("capacitor bank capacity estimate implausible");
                    cx.local.buzzer.play(2000, 20, snap.tick);
                }
            }
            _ => {
                if cx.local.ui.alert_tick(&snap, cx.local.buzzer, snap.tick) {
                    cx.shared.ctrl.lock(|c| c.auto_clear_error());
                }
            }
        }
    }

    /// Command frames from the bus.
    #[task(binds = FDCAN1_INTR0_IT, shared = [ctrl, can], priority = 3)]
    fn can_rx(mut cx: can_rx::Context) {
        let cmd = cx.shared.can.lock(|can| can.receive_command());
        if let Some(cmd) = cmd {
            let action = cx.shared.ctrl.lock(|c| c.on_command(cmd));
            if action == CommandAction::Restart {
                system_restart();
            }
        }
    }

    /// Bridge comparator fault: output is gone before this handler returns.
    #[task(binds = TIM1_BRK_TIM15, shared = [ctrl], local = [fault_pins], priority = 5)]
    fn bridge_fault(mut cx: bridge_fault::Context) {
        let p = &cx.local.fault_pins;
        let flags = protection::FaultFlags {
            ovp_primary: p[0].is_high(),
            ovp_secondary: p[1].is_high(),
            ocp_primary: p[2].is_high(),
            ocp_secondary: p[3].is_high(),
            ocp_reference: p[4].is_high(),
        };
        cx.shared.ctrl.lock(|c| {
            c.driver.acknowledge_fault();
            c.on_comparator_fault(flags);
        });
        defmt::warn!("bridge comparator fault: {}", flags);
    }
}

#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
