// Per-board ADC calibration. Each sampled channel carries a two-point linear
// fit (summed-code -> physical unit) measured on the production jig; the
// table is selected by the hardware id baked into the build and is checked
// against the MCU unique id at startup so a binary cannot run on the wrong
// power stage.

/// Two-point linear calibration for one ADC channel.
#[derive(Clone, Copy)]
pub struct ChannelCal {
    pub gain: f32,
    pub offset: f32,
}

impl ChannelCal {
    /// Converts an oversampled code sum to a physical value.
    #[inline(always)]
    pub fn apply(&self, code_sum: u16) -> f32 {
        code_sum as f32 * self.gain + self.offset
    }
}

/// Full calibration set for one power-stage board.
pub struct CalibrationTable {
    /// MCU unique id the table was measured on.
    pub uid: [u32; 3],
    pub v_primary: ChannelCal,
    pub v_secondary: ChannelCal,
    pub i_primary: ChannelCal,
    pub i_secondary: ChannelCal,
    pub i_reference: ChannelCal,
    pub v_aux: ChannelCal,
    pub i_aux: ChannelCal,
}

/// Board this firmware is built for.
pub const HARDWARE_ID: u16 = 101;

const TABLE_101: CalibrationTable = CalibrationTable {
    uid: [0x0054_0049, 0x534B_5008, 0x2034_3732],
    v_primary: ChannelCal {
        gain: 0.002_840_254_9,
        offset: 0.096_382_087,
    },
    v_secondary: ChannelCal {
        gain: 0.002_830_642_5,
        offset: 0.096_382_087,
    },
    i_primary: ChannelCal {
        gain: -0.004_260_327_1,
        offset: 34.622_056,
    },
    i_secondary: ChannelCal {
        gain: 0.004_369_613_5,
        offset: -35.442_372,
    },
    i_reference: ChannelCal {
        gain: 0.004_385_206_5,
        offset: -35.685_132,
    },
    v_aux: ChannelCal {
        gain: 0.002_828_622_4,
        offset: 0.126_888_44,
    },
    i_aux: ChannelCal {
        gain: 0.004_210_748_0,
        offset: -34.291_717,
    },
};

/// Calibration table for the board named by `HARDWARE_ID`.
pub const fn table() -> &'static CalibrationTable {
    &TABLE_101
}

/// Slow exponential averager over the raw code sums, used when deriving a
/// new calibration table against a bench reference. Never part of the
/// control path.
pub struct CalAverager {
    avg: [f32; crate::analog::CHANNEL_COUNT],
    alpha: f32,
}

impl CalAverager {
    pub const fn new() -> Self {
        Self {
            avg: [0.0; crate::analog::CHANNEL_COUNT],
            alpha: crate::config::CAL_AVG_ALPHA,
        }
    }

    /// Folds one tick of raw code sums into the running averages.
    pub fn update(&mut self, sums: &[u16; crate::analog::CHANNEL_COUNT]) {
        for (avg, &sum) in self.avg.iter_mut().zip(sums.iter()) {
            *avg = *avg * (1.0 - self.alpha) + sum as f32 * self.alpha;
        }
    }

    pub fn averages(&self) -> &[f32; crate::analog::CHANNEL_COUNT] {
        &self.avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_cal_is_a_straight_line() {
        let cal = ChannelCal {
            gain: 0.5,
            offset: -2.0,
        };
        assert_eq!(cal.apply(0), -2.0);
        assert_eq!(cal.apply(10), 3.0);
    }

    #[test]
    fn averager_converges_on_a_steady_code() {
        let mut avg = CalAverager::new();
        let sums = [8000u16; crate::analog::CHANNEL_COUNT];
        for _ in 0..10_000 {
            avg.update(&sums);
        }
        assert!((avg.averages()[0] - 8000.0).abs() < 10.0);
    }
}
