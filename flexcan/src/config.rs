//! CAN bus configuration

use crate::Error;
pub use flexcan_core::ClockSource;
use flexcan_core::Duration;
use fugit::HertzU32;

/// Number of controller instances the driver can be bound to
pub const MAX_INSTANCES: usize = 3;

/// Configuration for the CAN bus
///
/// Consumed by [`Can::init`](crate::bus::Can::init). Construct it with
/// [`CanConfig::new`] and adjust the public fields as needed.
#[derive(Copy, Clone, Debug)]
pub struct CanConfig {
    /// Clock routed to the protocol engine
    pub clock_source: ClockSource,
    /// Nominal bitrate of the bus
    pub bitrate: HertzU32,
    /// Operating mode
    pub mode: Mode,
    /// Receive frames transmitted by this controller when they match an RX
    /// filter
    pub self_reception: bool,
    /// Use the RX FIFO in buffers 0-7 in addition to the individual RX
    /// mailboxes
    pub rx_fifo: bool,
    /// Upper bound for every wait on a hardware acknowledge during
    /// configuration
    pub hardware_timeout: Duration,
}

impl CanConfig {
    /// Create an instance
    ///
    /// Nominal bitrate value must be provided, all other settings come
    /// pre-populated with default values.
    pub fn new(bitrate: HertzU32) -> Self {
        Self {
            clock_source: Default::default(),
            bitrate,
            mode: Default::default(),
            self_reception: false,
            rx_fifo: false,
            hardware_timeout: Duration::millis(1),
        }
    }
}

/// Operating mode of the controller
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Regular bus participation
    #[default]
    Normal,
    /// Transmitted frames are looped back internally and the bus is not
    /// driven. Useful for self tests.
    Loopback,
    /// Frames are received but the controller never transmits, not even
    /// acknowledge bits or error frames.
    ListenOnly,
}

/// Bit-timing parameters
///
/// All segment lengths are *real* values in time quanta; the extra
/// subtractions the registers expect are handled by the driver. One bit is
/// `1 + prop_seg + phase_seg_1 + phase_seg_2` time quanta long and a time
/// quantum lasts `prescaler + 1` clock periods.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingConfig {
    /// Clock divider minus one
    pub prescaler: u8,
    /// Propagation segment
    pub prop_seg: u8,
    /// Phase segment before the sample point
    pub phase_seg_1: u8,
    /// Phase segment after the sample point
    pub phase_seg_2: u8,
    /// Resynchronization jump width
    pub sjw: u8,
}

/// Segment layout `(prop_seg, phase_seg_1, phase_seg_2, sjw)` per supported
/// bit length. Both put the sample point at 75 %.
const SEGMENTS: [(u32, (u8, u8, u8, u8)); 2] = [(16, (7, 4, 4, 1)), (8, (2, 3, 2, 1))];

/// Largest divider the prescaler field can express
const MAX_DIVIDER: u32 = 256;

impl TimingConfig {
    /// Returns the number of time quanta that make up one bit time
    pub fn time_quanta_per_bit(&self) -> u32 {
        1 + u32::from(self.prop_seg) + u32::from(self.phase_seg_1) + u32::from(self.phase_seg_2)
    }

    /// Bitrate achieved on the bus when the protocol engine runs at `clock`
    pub fn bitrate(&self, clock: HertzU32) -> HertzU32 {
        let divider = (u32::from(self.prescaler) + 1) * self.time_quanta_per_bit();
        HertzU32::from_raw(clock.raw() / divider)
    }

    /// Sample point position in per mille of the bit time
    pub fn sample_point(&self) -> u32 {
        let before = 1 + u32::from(self.prop_seg) + u32::from(self.phase_seg_1);
        before * 1000 / self.time_quanta_per_bit()
    }

    fn with_segments(segments: (u8, u8, u8, u8), divider: u32) -> Self {
        let (prop_seg, phase_seg_1, phase_seg_2, sjw) = segments;
        Self {
            prescaler: (divider - 1) as u8,
            prop_seg,
            phase_seg_1,
            phase_seg_2,
            sjw,
        }
    }
}

/// Derives the bit timing for `bitrate` from the protocol engine clock.
///
/// A bit length of 16 time quanta is tried first; if the resulting divider
/// does not fit the prescaler, 8 time quanta are used instead. Exact dividers
/// win over inexact ones. Fails with [`Error::InvalidParam`] if neither bit
/// length yields a usable divider.
pub fn calculate_timing(clock: HertzU32, bitrate: HertzU32) -> Result<TimingConfig, Error> {
    let (clock, bitrate) = (clock.raw(), bitrate.raw());
    if clock == 0 || bitrate == 0 {
        return Err(Error::InvalidParam);
    }

    // (quanta, segments, divider, exact) for each bit length whose divider
    // is in range
    let mut candidates = SEGMENTS.iter().filter_map(|&(quanta, segments)| {
        let f_q = bitrate.checked_mul(quanta)?;
        let divider = clock / f_q;
        (1..=MAX_DIVIDER)
            .contains(&divider)
            .then_some((quanta, segments, divider, clock % f_q == 0))
    });
    let first = candidates.next().ok_or_else(|| {
        log::debug!("no prescaler for {} bit/s from a {} Hz clock", bitrate, clock);
        Error::InvalidParam
    })?;
    let (quanta, segments, divider, exact) = if first.3 {
        first
    } else {
        candidates.find(|c| c.3).unwrap_or(first)
    };

    let timing = TimingConfig::with_segments(segments, divider);
    if !exact {
        log::warn!(
            "requested {} bit/s, achieving {} bit/s",
            bitrate,
            clock / (divider * quanta)
        );
    }
    Ok(timing)
}

#[cfg(test)]
mod test {
    use super::*;
    use fugit::RateExtU32;

    #[test]
    fn scenario_40mhz_500kbit() {
        let timing = calculate_timing(40.MHz(), 500.kHz()).unwrap();
        assert_eq!(timing.prescaler, 4);
        assert_eq!(timing.time_quanta_per_bit(), 16);
        assert_eq!(timing.bitrate(40.MHz()), 500.kHz::<1, 1>());
    }

    #[test]
    fn segments_always_add_up_to_the_bit_length() {
        for (quanta, (p, s1, s2, sjw)) in SEGMENTS {
            assert_eq!(1 + u32::from(p + s1 + s2), quanta);
            assert!(sjw <= s1 && sjw <= s2);
            assert!((1..=8).contains(&p) && (1..=8).contains(&s1) && (2..=8).contains(&s2));
        }
    }

    #[test]
    fn exact_16_quanta_pairs_reproduce_the_bitrate() {
        let clocks = [8_000_000u32, 16_000_000, 24_000_000, 40_000_000, 80_000_000];
        let bitrates = [10_000u32, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000];
        for clock in clocks {
            for bitrate in bitrates {
                let f_q = bitrate * 16;
                let divider = clock / f_q;
                if clock % f_q != 0 || !(1..=256).contains(&divider) {
                    continue;
                }
                let timing =
                    calculate_timing(clock.Hz(), bitrate.Hz()).unwrap();
                assert_eq!(timing.time_quanta_per_bit(), 16);
                assert_eq!(u32::from(timing.prescaler), divider - 1);
                assert_eq!(clock / ((u32::from(timing.prescaler) + 1) * 16), bitrate);
            }
        }
    }

    #[test]
    fn falls_back_to_8_quanta_when_16_is_out_of_range() {
        // 8 MHz cannot produce 1 Mbit/s with 16 quanta (divider 0)
        let timing = calculate_timing(8.MHz(), 1.MHz()).unwrap();
        assert_eq!(timing.time_quanta_per_bit(), 8);
        assert_eq!(timing.prescaler, 0);
        assert_eq!(
            (timing.prop_seg, timing.phase_seg_1, timing.phase_seg_2, timing.sjw),
            (2, 3, 2, 1)
        );
        assert_eq!(timing.bitrate(8.MHz()), 1.MHz::<1, 1>());

        let timing = calculate_timing(4.MHz(), 500.kHz()).unwrap();
        assert_eq!(timing.time_quanta_per_bit(), 8);
        assert_eq!(timing.bitrate(4.MHz()), 500.kHz::<1, 1>());
    }

    #[test]
    fn exact_8_quanta_beats_inexact_16_quanta() {
        // 24 MHz / (1 Mbit/s * 16) is 1.5, 24 MHz / (1 Mbit/s * 8) is 3
        let timing = calculate_timing(24.MHz(), 1.MHz()).unwrap();
        assert_eq!(timing.time_quanta_per_bit(), 8);
        assert_eq!(timing.prescaler, 2);
    }

    #[test]
    fn inexact_pairs_still_get_the_closest_16_quanta_divider() {
        let timing = calculate_timing(40.MHz(), 300.kHz()).unwrap();
        assert_eq!(timing.time_quanta_per_bit(), 16);
        assert_eq!(timing.prescaler, 7);
        assert_eq!(timing.bitrate(40.MHz()), 312_500.Hz::<1, 1>());
    }

    #[test]
    fn unreachable_pairs_are_rejected() {
        // Divider above 256 with either bit length
        assert_eq!(calculate_timing(80.MHz(), 1.kHz()), Err(Error::InvalidParam));
        // Clock slower than 8 quanta per bit
        assert_eq!(calculate_timing(4.MHz(), 1.MHz()), Err(Error::InvalidParam));
        assert_eq!(calculate_timing(0.Hz(), 500.kHz()), Err(Error::InvalidParam));
        assert_eq!(calculate_timing(40.MHz(), 0.Hz()), Err(Error::InvalidParam));
    }

    #[test]
    fn sample_point_is_75_percent() {
        assert_eq!(calculate_timing(40.MHz(), 500.kHz()).unwrap().sample_point(), 750);
        assert_eq!(calculate_timing(8.MHz(), 1.MHz()).unwrap().sample_point(), 750);
    }
}
