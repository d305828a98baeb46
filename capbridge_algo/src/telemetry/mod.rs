// Payload layout for the field-bus link: the periodic status frame (legacy
// and fixed-point formats) and the inbound command frame. Only the byte
// layout lives here; frame transport belongs to the CAN driver. The legacy
// format stays in use until a command explicitly selects the new one.

use crate::aux_charge::ChargeStatus;
use crate::control::LimitFactor;
use crate::protection::Severity;

pub const STATUS_ID_LEGACY: u16 = 0x051;
pub const STATUS_ID_NEW: u16 = 0x052;
pub const COMMAND_ID: u16 = 0x061;

/// Fixed-point power encoding of the new format: 1/64 W resolution over
/// −256 W … +768 W.
const POWER_SCALE: f32 = 64.0;
const POWER_OFFSET: f32 = 16384.0;

/// One classic-CAN payload ready for the bus driver.
#[derive(Clone, Copy)]
pub struct Frame {
    pub id: u16,
    pub data: [u8; 8],
}

/// Everything the status frame reports, gathered by the orchestrator.
pub struct StatusView {
    pub output_enabled: bool,
    pub use_new_feedback: bool,
    pub charge_status: ChargeStatus,
    pub limit_factor: LimitFactor,
    pub severity: Severity,

    pub p_chassis_lf: f32,
    pub p_referee_lf: f32,
    pub v_cap_lf: f32,
    /// Bank capability plus the commanded limit, in whole watts.
    pub power_limit_feedback: u16,
}

impl StatusView {
    pub fn encode(&self) -> Frame {
        if self.use_new_feedback {
            self.encode_new()
        } else {
            self.encode_legacy()
        }
    }

    fn status_byte(&self) -> u8 {
        ((self.output_enabled as u8) << 7)
            | ((self.use_new_feedback as u8) << 6)
            | (self.charge_status.wire_code() << 4)
            | (self.limit_factor.wire_code() << 2)
            | self.severity.wire_code()
    }

    fn cap_energy_byte(&self) -> u8 {
        let frac = (self.v_cap_lf * self.v_cap_lf)
            / (crate::config::CAP_MAX_VOLTAGE * crate::config::CAP_MAX_VOLTAGE);
        libm::roundf(frac.clamp(0.0, 1.0) * 250.0) as u8
    }

    fn encode_legacy(&self) -> Frame {
        let mut data = [0u8; 8];
        data[0] = self.status_byte();
        data[1..5].copy_from_slice(&self.p_chassis_lf.to_le_bytes());
        data[5..7].copy_from_slice(&self.power_limit_feedback.to_le_bytes());
        data[7] = self.cap_energy_byte();
        Frame {
            id: STATUS_ID_LEGACY,
            data,
        }
    }

    fn encode_new(&self) -> Frame {
        let mut data = [0u8; 8];
        data[0] = self.status_byte();
        data[1..3].copy_from_slice(&encode_power(self.p_chassis_lf).to_le_bytes());
        data[3..5].copy_from_slice(&encode_power(self.p_referee_lf).to_le_bytes());
        data[5..7].copy_from_slice(&self.power_limit_feedback.to_le_bytes());
        data[7] = self.cap_energy_byte();
        Frame {
            id: STATUS_ID_NEW,
            data,
        }
    }
}

fn encode_power(watts: f32) -> u16 {
    libm::roundf(watts * POWER_SCALE + POWER_OFFSET).clamp(0.0, 65535.0) as u16
}

fn decode_power(raw: u16) -> f32 {
    (raw as f32 - POWER_OFFSET) / POWER_SCALE
}

/// Inbound command payload.
#[derive(Clone, Copy, Default, defmt::Format)]
pub struct Command {
    pub enable_output: bool,
    pub restart: bool,
    pub clear_error: bool,
    pub enable_active_charging_limit: bool,
    pub use_new_feedback: bool,

    pub power_limit: u16,
    pub energy_buffer: u16,
    /// Requested bank energy as a 0-255 fraction of full.
    pub charge_ratio: u8,
}

impl Command {
    pub fn decode(data: &[u8; 8]) -> Self {
        let flags = data[0];
        Self {
            enable_output: flags & (1 << 0) != 0,
            restart: flags & (1 << 1) != 0,
            clear_error: flags & (1 << 5) != 0,
            enable_active_charging_limit: flags & (1 << 6) != 0,
            use_new_feedback: flags & (1 << 7) != 0,
            power_limit: u16::from_le_bytes([data[1], data[2]]),
            energy_buffer: u16::from_le_bytes([data[3], data[4]]),
            charge_ratio: data[5],
        }
    }

    /// Counterpart of `decode`, used by the host-side tooling and tests.
    pub fn encode(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[0] = (self.enable_output as u8)
            | ((self.restart as u8) << 1)
            | ((self.clear_error as u8) << 5)
            | ((self.enable_active_charging_limit as u8) << 6)
            | ((self.use_new_feedback as u8) << 7);
        data[1..3].copy_from_slice(&self.power_limit.to_le_bytes());
        data[3..5].copy_from_slice(&self.energy_buffer.to_le_bytes());
        data[5] = self.charge_ratio;
        data
    }
}

/// Decoded view of a status frame, as the upstream side sees it.
pub struct DecodedStatus {
    pub output_enabled: bool,
    pub new_format: bool,
    pub charge_status_code: u8,
    pub limit_factor_code: u8,
    pub severity_code: u8,
    pub chassis_power: f32,
    /// Only carried by the new format.
    pub referee_power: Option<f32>,
    pub power_limit: u16,
    pub energy_fraction: f32,
}

pub fn decode_status(frame: &Frame) -> DecodedStatus {
    let status = frame.data[0];
    let new_format = frame.id == STATUS_ID_NEW;
    let chassis_power = if new_format {
        decode_power(u16::from_le_bytes([frame.data[1], frame.data[2]]))
    } else {
        f32::from_le_bytes([frame.data[1], frame.data[2], frame.data[3], frame.data[4]])
    };
    DecodedStatus {
        output_enabled: status & 0x80 != 0,
        new_format: status & 0x40 != 0,
        charge_status_code: (status >> 4) & 0x03,
        limit_factor_code: (status >> 2) & 0x03,
        severity_code: status & 0x03,
        chassis_power,
        referee_power: new_format
            .then(|| decode_power(u16::from_le_bytes([frame.data[3], frame.data[4]]))),
        power_limit: u16::from_le_bytes([frame.data[5], frame.data[6]]),
        energy_fraction: frame.data[7] as f32 / 250.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn view() -> StatusView {
        StatusView {
            output_enabled: true,
            use_new_feedback: true,
            charge_status: ChargeStatus::Off,
            limit_factor: LimitFactor::RefereePower,
            severity: Severity::NoError,
            p_chassis_lf: -100.0,
            p_referee_lf: 50.0,
            v_cap_lf: libm::sqrtf(0.5) * config::CAP_MAX_VOLTAGE,
            power_limit_feedback: 200,
        }
    }

    #[test]
    fn new_format_round_trips_within_resolution() {
        let frame = view().encode();
        assert_eq!(frame.id, STATUS_ID_NEW);

        let d = decode_status(&frame);
        assert!(d.output_enabled);
        assert!(d.new_format);
        assert!((d.chassis_power + 100.0).abs() <= 0.02);
        assert!((d.referee_power.unwrap() - 50.0).abs() <= 0.02);
        assert_eq!(d.power_limit, 200);
        assert!((d.energy_fraction - 0.5).abs() <= 1.0 / 250.0);
    }

    #[test]
    fn legacy_format_carries_power_as_float() {
        let mut v = view();
        v.use_new_feedback = false;
        let frame = v.encode();
        assert_eq!(frame.id, STATUS_ID_LEGACY);

        let d = decode_status(&frame);
        assert_eq!(d.chassis_power, -100.0);
        assert_eq!(d.power_limit, 200);
        assert!(d.referee_power.is_none());
    }

    #[test]
    fn status_byte_packs_every_field() {
        let mut v = view();
        v.charge_status = ChargeStatus::Charging;
        v.limit_factor = LimitFactor::CapCurrentDischarge;
        v.severity = Severity::RecoverManual;
        let frame = v.encode();
        assert_eq!(frame.data[0], 0b1110_1110);
    }

    #[test]
    fn warning_severity_reads_as_clear_on_the_wire() {
        let mut v = view();
        v.severity = Severity::Warning;
        let d = decode_status(&v.encode());
        assert_eq!(d.severity_code, 0);
    }

    #[test]
    fn command_round_trip() {
        let cmd = Command {
            enable_output: true,
            restart: false,
            clear_error: true,
            enable_active_charging_limit: true,
            use_new_feedback: false,
            power_limit: 80,
            energy_buffer: 42,
            charge_ratio: 200,
        };
        let out = Command::decode(&cmd.encode());
        assert!(out.enable_output && out.clear_error && out.enable_active_charging_limit);
        assert!(!out.restart && !out.use_new_feedback);
        assert_eq!(out.power_limit, 80);
        assert_eq!(out.energy_buffer, 42);
        assert_eq!(out.charge_ratio, 200);
    }
}
