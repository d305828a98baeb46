use hal::gpio::{Pin, PinMode, Port};

/// Compile-time GPIO definition; `init` claims and configures the pin.
pub struct PinDef {
    port: Port,
    pin: u8,
    mode: PinMode,
}

impl PinDef {
    pub const fn new(port: Port, pin: u8, mode: PinMode) -> PinDef {
        PinDef { port, pin, mode }
    }

    pub fn init(&self) -> Pin {
        Pin::new(self.port, self.pin, self.mode)
    }
}

/// Bridge gate drive and supervision.
pub mod bridge {
    use super::*;

    /// Primary leg gate pair (TIM1 CH1/CH1N).
    pub const GATE_PRI_H: PinDef = PinDef::new(Port::A, 8, PinMode::Alt(6));
    pub const GATE_PRI_L: PinDef = PinDef::new(Port::B, 13, PinMode::Alt(6));

    /// Secondary leg gate pair (TIM8 CH1/CH1N).
    pub const GATE_SEC_H: PinDef = PinDef::new(Port::C, 6, PinMode::Alt(4));
    pub const GATE_SEC_L: PinDef = PinDef::new(Port::C, 10, PinMode::Alt(4));

    /// Auxiliary output group gate (TIM8 CH2).
    pub const GATE_AUX: PinDef = PinDef::new(Port::C, 7, PinMode::Alt(4));

    /// Gate driver supply enable.
    pub const GATE_ENABLE: PinDef = PinDef::new(Port::B, 12, PinMode::Output);

    /// Latched comparator outputs. The OR of these drives the timer break
    /// input; the fault handler reads them back to attribute the trip.
    pub const FAULT_OVP_PRI: PinDef = PinDef::new(Port::B, 10, PinMode::Input);
    pub const FAULT_OCP_PRI: PinDef = PinDef::new(Port::B, 11, PinMode::Input);
    pub const FAULT_OCP_REF: PinDef = PinDef::new(Port::B, 14, PinMode::Input);
    pub const FAULT_OVP_SEC: PinDef = PinDef::new(Port::B, 15, PinMode::Input);
    pub const FAULT_OCP_SEC: PinDef = PinDef::new(Port::A, 15, PinMode::Input);
}

/// Synchronously sampled analog channels. The constants are ADC1 channel
/// numbers matching the acquisition sequence.
pub mod analog {
    use super::*;

    pub const I_PRIMARY: PinDef = PinDef::new(Port::A, 0, PinMode::Analog);
    pub const I_SECONDARY: PinDef = PinDef::new(Port::A, 1, PinMode::Analog);
    pub const I_REFERENCE: PinDef = PinDef::new(Port::A, 2, PinMode::Analog);
    pub const V_PRIMARY: PinDef = PinDef::new(Port::A, 3, PinMode::Analog);
    pub const V_SECONDARY: PinDef = PinDef::new(Port::B, 0, PinMode::Analog);
    pub const V_AUX: PinDef = PinDef::new(Port::B, 1, PinMode::Analog);
    pub const I_AUX: PinDef = PinDef::new(Port::B, 2, PinMode::Analog);

    /// Low-rate rail monitor (ADC2).
    pub const V_RAIL: PinDef = PinDef::new(Port::C, 4, PinMode::Analog);
    pub const NTC: PinDef = PinDef::new(Port::C, 5, PinMode::Analog);
}

/// Human interface.
pub mod interface {
    use super::*;

    pub const LED_SYSTEM: PinDef = PinDef::new(Port::B, 5, PinMode::Output);
    pub const LED_POWER: PinDef = PinDef::new(Port::B, 6, PinMode::Output);
    pub const LED_COMM: PinDef = PinDef::new(Port::B, 7, PinMode::Output);

    pub const BUTTON: PinDef = PinDef::new(Port::C, 13, PinMode::Input);

    /// Buzzer drive (TIM3 CH1).
    pub const BUZZER: PinDef = PinDef::new(Port::B, 4, PinMode::Alt(2));
}

/// Field bus.
pub mod comm {
    use super::*;

    pub const CAN_RX: PinDef = PinDef::new(Port::B, 8, PinMode::Alt(9));
    pub const CAN_TX: PinDef = PinDef::new(Port::B, 9, PinMode::Alt(9));
}
