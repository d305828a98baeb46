// Human-interface glue: button long-press decoding, per-fault alert
// melodies and the three status LEDs. Only presentation lives here; every
// trigger condition comes from the control core.

use capbridge_algo::protection::{self, Severity};
use capbridge_drivers::buzzer::Buzzer;
use capbridge_drivers::pinout;
use hal::gpio::Pin;

const NOTE_HIGH: u16 = 1600;
const NOTE_LOW: u16 = 400;
const DUR_HIGH: u16 = 100;
const DUR_LOW: u16 = 250;
/// Full alert cycle in housekeeping-phase ticks; wrapping it also fires the
/// periodic auto-clear attempt.
const ALERT_PERIOD: u16 = 5000;

pub struct Note {
    start: u16,
    freq: u16,
    duration: u16,
}

const fn n(start: u16, freq: u16, duration: u16) -> Note {
    Note {
        start,
        freq,
        duration,
    }
}

static MELODY_NONE: &[Note] = &[];
static MELODY_UNRECOVERABLE: &[Note] = &[
    n(0, NOTE_HIGH, DUR_HIGH),
    n(200, NOTE_HIGH, DUR_HIGH),
    n(400, NOTE_HIGH, DUR_HIGH),
    n(600, NOTE_HIGH, DUR_HIGH),
    n(800, NOTE_HIGH, DUR_HIGH),
    n(1300, NOTE_LOW, DUR_LOW),
];
static MELODY_SCP_PRIMARY: &[Note] = &[
    n(0, NOTE_HIGH, DUR_HIGH),
    n(200, NOTE_HIGH, DUR_HIGH),
    n(400, NOTE_HIGH, DUR_HIGH),
    n(600, NOTE_HIGH, DUR_HIGH),
    n(1100, NOTE_LOW, DUR_LOW),
];
static MELODY_SCP_SECONDARY: &[Note] = &[
    n(0, NOTE_HIGH, DUR_HIGH),
    n(200, NOTE_HIGH, DUR_HIGH),
    n(400, NOTE_HIGH, DUR_HIGH),
    n(600, NOTE_HIGH, DUR_HIGH),
    n(1100, NOTE_LOW, DUR_LOW),
    n(1600, NOTE_LOW, DUR_LOW),
];
static MELODY_OCP_PRIMARY: &[Note] = &[
    n(0, NOTE_HIGH, DUR_HIGH),
    n(200, NOTE_HIGH, DUR_HIGH),
    n(400, NOTE_HIGH, DUR_HIGH),
    n(900, NOTE_LOW, DUR_HIGH),
];
static MELODY_OCP_SECONDARY: &[Note] = &[
    n(0, NOTE_HIGH, DUR_HIGH),
    n(200, NOTE_HIGH, DUR_HIGH),
    n(400, NOTE_HIGH, DUR_HIGH),
    n(900, NOTE_LOW, DUR_HIGH),
    n(1100, NOTE_LOW, DUR_HIGH),
];
static MELODY_OCP_REFERENCE: &[Note] = &[
    n(0, NOTE_HIGH, DUR_HIGH),
    n(200, NOTE_HIGH, DUR_HIGH),
    n(400, NOTE_HIGH, DUR_HIGH),
    n(900, NOTE_LOW, DUR_HIGH),
    n(1100, NOTE_LOW, DUR_HIGH),
    n(1300, NOTE_LOW, DUR_HIGH),
];
static MELODY_OVP_PRIMARY: &[Note] = &[
    n(0, NOTE_HIGH, DUR_HIGH),
    n(200, NOTE_HIGH, DUR_HIGH),
    n(400, NOTE_HIGH, DUR_HIGH),
    n(900, NOTE_LOW, DUR_LOW),
];
static MELODY_OVP_SECONDARY: &[Note] = &[
    n(0, NOTE_HIGH, DUR_HIGH),
    n(200, NOTE_HIGH, DUR_HIGH),
    n(400, NOTE_HIGH, DUR_HIGH),
    n(900, NOTE_LOW, DUR_LOW),
    n(1400, NOTE_LOW, DUR_LOW),
];
static MELODY_LOW_BATTERY: &[Note] = &[
    n(0, 1600, 40),
    n(40, 800, 40),
    n(80, 1600, 40),
    n(120, 800, 40),
];

fn select_melody(severity: Severity, code: u16) -> &'static [Note] {
    match severity {
        Severity::Unrecoverable => MELODY_UNRECOVERABLE,
        Severity::RecoverManual => {
            if code & protection::ERROR_SCP_SECONDARY != 0 {
                MELODY_SCP_SECONDARY
            } else {
                MELODY_SCP_PRIMARY
            }
        }
        Severity::RecoverAuto => {
            if code & protection::ERROR_OCP_PRIMARY != 0 {
                MELODY_OCP_PRIMARY
            } else if code & protection::ERROR_OCP_SECONDARY != 0 {
                MELODY_OCP_SECONDARY
            } else if code & protection::ERROR_OCP_REFERENCE != 0 {
                MELODY_OCP_REFERENCE
            } else if code & protection::ERROR_OVP_PRIMARY != 0 {
                MELODY_OVP_PRIMARY
            } else {
                MELODY_OVP_SECONDARY
            }
        }
        Severity::Warning => {
            if code & protection::WARNING_LOW_BATTERY != 0 {
                MELODY_LOW_BATTERY
            } else {
                MELODY_NONE
            }
        }
        Severity::NoError => MELODY_NONE,
    }
}

#[derive(PartialEq, Eq)]
pub enum ButtonAction {
    None,
    ClearError,
    Restart,
}

/// Control-core status the interface renders, captured under one lock.
pub struct StatusSnapshot {
    pub severity: Severity,
    pub error_code: u16,
    pub output_enabled: bool,
    pub connected: bool,
    pub charging: bool,
    pub tick: u32,
}

pub struct Interface {
    led_system: Pin,
    led_power: Pin,
    led_comm: Pin,
    button: Pin,

    button_cnt: u16,
    button_pressed_last: bool,

    alert_active_last: bool,
    sequence_cnt: u16,
    note_index: usize,
    melody: &'static [Note],
}

impl Interface {
    pub fn new() -> Self {
        Self {
            led_system: pinout::interface::LED_SYSTEM.init(),
            led_power: pinout::interface::LED_POWER.init(),
            led_comm: pinout::interface::LED_COMM.init(),
            button: pinout::interface::BUTTON.init(),
            button_cnt: 0,
            button_pressed_last: false,
            alert_active_last: false,
            sequence_cnt: 0,
            note_index: 0,
            melody: MELODY_NONE,
        }
    }

    /// 1 kHz button service (active-low input). A press released inside the
    /// 1-2 s window requests an error clear; holding past 3 s requests a
    /// hardware restart.
    pub fn poll_button(&mut self) -> ButtonAction {
        let mut action = ButtonAction::None;
        if self.button.is_high() {
            if self.button_pressed_last && self.button_cnt > 1000 && self.button_cnt < 2000 {
                action = ButtonAction::ClearError;
            }
            self.button_pressed_last = false;
            self.button_cnt = 0;
        } else {
            self.button_pressed_last = true;
            self.button_cnt += 1;
            if self.button_cnt > 3000 {
                action = ButtonAction::Restart;
            }
        }
        action
    }

    /// System LED solid when healthy, blinking on recoverable trouble, dark
    /// when unrecoverable; power LED follows the output stage (blink while
    /// charging); comm LED follows the link.
    pub fn refresh_leds(&mut self, s: &StatusSnapshot) {
        let blink = s.tick & 0x100 != 0;
        match s.severity {
            Severity::NoError => self.led_system.set_high(),
            Severity::Unrecoverable => self.led_system.set_low(),
            _ => {
                if blink {
                    self.led_system.set_high()
                } else {
                    self.led_system.set_low()
                }
            }
        }

        if !s.output_enabled {
            self.led_power.set_low();
        } else if s.charging && blink {
            self.led_power.set_low();
        } else {
            self.led_power.set_high();
        }

        if s.connected {
            self.led_comm.set_high();
        } else {
            self.led_comm.set_low();
        }
    }

    /// Alert sequencer, slow phase 3. Walks the melody keyed by the active
    /// fault; returns true when the cycle wrapped and the periodic
    /// auto-clear should be attempted.
    pub fn alert_tick(&mut self, s: &StatusSnapshot, buzzer: &mut Buzzer, now: u32) -> bool {
        let active = s.severity != Severity::NoError;
        if !active {
            self.alert_active_last = false;
            self.sequence_cnt = 0;
            self.note_index = 0;
            return false;
        }
        if !self.alert_active_last {
            self.sequence_cnt = 0;
            self.note_index = 0;
            self.melody = select_melody(s.severity, s.error_code);
        }
        self.alert_active_last = true;

        if let Some(note) = self.melody.get(self.note_index) {
            if self.sequence_cnt == note.start {
                buzzer.play(note.freq, note.duration as u32, now);
                self.note_index += 1;
            }
        }

        self.sequence_cnt += 1;
        if self.sequence_cnt >= ALERT_PERIOD {
            self.sequence_cnt = 0;
            self.note_index = 0;
            return true;
        }
        false
    }
}
