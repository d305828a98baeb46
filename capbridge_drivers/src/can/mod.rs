// Classic-CAN transport over the G474 FDCAN peripheral, driven through the
// `fdcan` crate. Only transport lives here; payload layout belongs to
// `capbridge_algo::telemetry`.

use capbridge_algo::telemetry::{self, Frame};

use core::num::{NonZeroU16, NonZeroU8};

use fdcan::{
    config::NominalBitTiming,
    filter::{StandardFilter, StandardFilterSlot},
    frame::{FrameFormat, TxFrameHeader},
    id::{Id, StandardId},
    FdCan, NormalOperationMode,
};
use hal::can::Can;
use hal::pac::FDCAN1;

use super::pinout;

pub struct CanBus {
    can: FdCan<Can, NormalOperationMode>,
}

impl CanBus {
    /// Brings the peripheral up at 1 Mbit/s (classic frames only) with the
    /// command identifier routed to FIFO 0.
    pub fn new(fdcan: FDCAN1) -> Self {
        pinout::comm::CAN_RX.init();
        pinout::comm::CAN_TX.init();

        let mut can = FdCan::new(Can::new(fdcan)).into_config_mode();
        // 170 MHz kernel clock: 1 Mbit/s with the sample point at 88 %.
        can.set_nominal_bit_timing(NominalBitTiming {
            prescaler: NonZeroU16::new(10).unwrap(),
            seg1: NonZeroU8::new(14).unwrap(),
            seg2: NonZeroU8::new(2).unwrap(),
            sync_jump_width: NonZeroU8::new(1).unwrap(),
        });
        can.set_standard_filter(
            StandardFilterSlot::_0,
            StandardFilter::accept_all_into_fifo0(),
        );
        Self {
            can: can.into_normal(),
        }
    }

    /// Queues a status frame. A full TX queue drops the frame; the next
    /// housekeeping cycle sends a fresher one anyway.
    pub fn send(&mut self, frame: &Frame) {
        let Some(id) = StandardId::new(frame.id) else {
            return;
        };
        let header = TxFrameHeader {
            len: frame.data.len() as u8,
            frame_format: FrameFormat::Standard,
            id: Id::Standard(id),
            bit_rate_switching: false,
            marker: None,
        };
        let _ = self.can.transmit(header, &frame.data);
    }

    /// Drains FIFO 0 and returns the latest valid command payload, if any.
    pub fn receive_command(&mut self) -> Option<telemetry::Command> {
        let mut latest = None;
        let mut data = [0u8; 8];
        while let Ok(overrun) = self.can.receive0(&mut data) {
            let info = overrun.unwrap();
            let raw_id = match info.id {
                Id::Standard(sid) => sid.as_raw(),
                Id::Extended(_) => continue,
            };
            if raw_id == telemetry::COMMAND_ID && info.len == 8 {
                latest = Some(telemetry::Command::decode(&data));
            }
        }
        latest
    }
}
