//! Hardware adaptation for the CapBridge power stage: pin tables, the bridge
//! timer/DAC driver behind the control core's `PowerStageDriver` seam, the
//! synchronous acquisition setup, the CAN transport and the buzzer.

#![no_std]

pub mod acquisition;
pub mod bridge;
pub mod buzzer;
pub mod can;
pub mod pinout;
