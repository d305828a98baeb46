// Synchronous analog acquisition. ADC1 sweeps the seven fast channels in
// hardware sequence, DMA-chained so one fast tick collects `OVERSAMPLE`
// back-to-back sweeps into the raw frame the sampler consumes. ADC2 serves
// the low-rate rail/NTC pair from the housekeeping loop.

use capbridge_algo::analog::CHANNEL_COUNT;
use capbridge_algo::config::OVERSAMPLE;

use hal::{
    adc::{Adc, AdcDevice, AdcInterrupt, Align, InputType, SampleTime},
    clocks::Clocks,
    dma::{DmaChannel, DmaPeriph},
    pac::{ADC1, ADC2},
};

use super::pinout;

/// ADC1 channel numbers, in acquisition order. Must agree with the channel
/// slots in `capbridge_algo::analog`.
pub const FAST_SEQUENCE: [u8; CHANNEL_COUNT] = [1, 2, 3, 4, 15, 12, 14];

/// ADC2 channel numbers for the low-rate pair (NTC, rail).
pub const SLOW_SEQUENCE: [u8; 2] = [11, 5];

pub const RAW_FRAME_LEN: usize = CHANNEL_COUNT * OVERSAMPLE;

pub struct FastAdc {
    adc: Adc<ADC1>,
}

impl FastAdc {
    pub fn new(adc1: ADC1, clock_cfg: &Clocks) -> Self {
        pinout::analog::I_PRIMARY.init();
        pinout::analog::I_SECONDARY.init();
        pinout::analog::I_REFERENCE.init();
        pinout::analog::V_PRIMARY.init();
        pinout::analog::V_SECONDARY.init();
        pinout::analog::V_AUX.init();
        pinout::analog::I_AUX.init();

        let mut adc = Adc::new_adc1(
            adc1,
            AdcDevice::One,
            Default::default(),
            clock_cfg.systick(),
        );

        for (rank, &ch) in FAST_SEQUENCE.iter().enumerate() {
            adc.set_sequence(ch, rank as u8 + 1);
            adc.set_input_type(ch, InputType::SingleEnded);
            adc.set_sample_time(ch, SampleTime::T2);
        }
        adc.set_sequence_len(CHANNEL_COUNT as u8);
        adc.set_align(Align::Right);
        adc.enable_interrupt(AdcInterrupt::EndOfSequence);

        Self { adc }
    }

    /// Kicks off the DMA collection of the next raw frame.
    ///
    /// # Safety
    /// `buf` must stay untouched until the DMA transfer-complete interrupt.
    pub unsafe fn start_frame(&mut self, buf: &mut [u16; RAW_FRAME_LEN]) {
        self.adc.read_dma(
            buf,
            &FAST_SEQUENCE,
            DmaChannel::C1,
            Default::default(),
            DmaPeriph::Dma1,
        );
    }
}

pub struct SlowAdc {
    adc: Adc<ADC2>,
}

impl SlowAdc {
    pub fn new(adc2: ADC2, clock_cfg: &Clocks) -> Self {
        pinout::analog::V_RAIL.init();
        pinout::analog::NTC.init();

        let mut adc = Adc::new_adc2(
            adc2,
            AdcDevice::Two,
            Default::default(),
            clock_cfg.systick(),
        );
        for &ch in SLOW_SEQUENCE.iter() {
            adc.set_input_type(ch, InputType::SingleEnded);
            adc.set_sample_time(ch, SampleTime::T24);
        }
        Self { adc }
    }

    /// Blocking read of the low-rate pair; cheap enough for the 1 kHz phase.
    pub fn read_pair(&mut self) -> [u16; 2] {
        [
            self.adc.read(SLOW_SEQUENCE[0]),
            self.adc.read(SLOW_SEQUENCE[1]),
        ]
    }
}
