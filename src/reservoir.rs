//! Bit reservoir
//!
//! A frame may start its main data before its own header, in space left
//! unused by earlier frames. `resv_size` tracks how many bits of such space
//! are available; it always equals `main_data_begin * 8` between frames.
//! Each frame adds its mean bit budget, subtracts what its granules used,
//! and drains as stuffing whatever would exceed `resv_max` or break byte
//! alignment.

use log::debug;

use crate::config::Config;
use crate::types::{GranuleInfo, SideInfo, MAX_BITS_PER_CHANNEL, MAX_BITS_PER_GRANULE};

/// Budget of one frame as computed at frame begin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBudget {
    /// Average bits per granule, all channels together
    pub mean_bits: i32,
    /// Most bits the frame's granules may use in total
    pub full_frame_bits: i32,
}

/// Bit reservoir for managing bit allocation across frames
#[derive(Debug, Default)]
pub struct BitReservoir {
    /// Current reservoir size in bits
    resv_size: i32,
    /// Maximum reservoir size in bits for the current frame
    resv_max: i32,
}

impl BitReservoir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a frame at `bitrate_index`
    ///
    /// Sets `resv_max` for the frame. `disable_reservoir` forces it to
    /// zero. The frame may use its own mean bits plus whatever the reservoir
    /// holds, up to the largest frame a decoder must buffer.
    pub fn frame_begin(&mut self, config: &Config, bitrate_index: usize, padding: bool) -> FrameBudget {
        let mode_gr = config.mode_gr() as i32;
        let frame_length = config.frame_bits(bitrate_index, padding) as i32;
        let mean_bits = (frame_length - 8 * config.side_info_len() as i32) / mode_gr;

        let resv_limit = 8 * 256 * mode_gr - 8;
        let max_mp3_buf = config.max_frame_buffer_bits() as i32;
        self.resv_max = (max_mp3_buf - frame_length).min(resv_limit);
        if self.resv_max < 0 || config.mpeg.disable_reservoir {
            self.resv_max = 0;
        }

        let full_frame_bits = (mean_bits * mode_gr + self.resv_size.min(self.resv_max)).min(max_mp3_buf);
        FrameBudget {
            mean_bits,
            full_frame_bits,
        }
    }

    /// Target and extra bits for one granule
    ///
    /// Returns `(target, extra)`: the bits a granule should normally use and
    /// how many more it may take from the reservoir.
    pub fn max_reservoir_bits(&self, mean_bits: i32, cbr: bool, disable_reservoir: bool) -> (i32, i32) {
        let resv_size = if cbr { self.resv_size + mean_bits } else { self.resv_size };
        let resv_max = self.resv_max;
        let mut target = mean_bits;

        // extra bits if the reservoir is almost full
        let add_bits = if resv_size * 10 > resv_max * 9 {
            let add_bits = resv_size - (resv_max * 9) / 10;
            target += add_bits;
            add_bits
        } else {
            if !disable_reservoir {
                target -= mean_bits / 10;
            }
            0
        };

        let extra = (resv_size.min((resv_max * 6) / 10) - add_bits).max(0);
        (target, extra)
    }

    /// Split a granule's budget between channels by perceptual entropy
    ///
    /// Fills `targ_bits` for each channel of `pe` and returns the granule's
    /// upper bit limit.
    pub fn on_pe(&self, pe: &[f32], targ_bits: &mut [i32], mean_bits: i32, cbr: bool, disable_reservoir: bool) -> i32 {
        let channels = pe.len() as i32;
        let (tbits, mut extra_bits) = self.max_reservoir_bits(mean_bits, cbr, disable_reservoir);
        let max_bits = (tbits + extra_bits).min(MAX_BITS_PER_GRANULE as i32);

        let mut add_bits = [0i32; 2];
        let mut bits = 0;
        for ch in 0..pe.len() {
            targ_bits[ch] = (tbits / channels).min(MAX_BITS_PER_CHANNEL as i32);
            let mut add = (targ_bits[ch] as f32 * pe[ch] / 700.0) as i32 - targ_bits[ch];
            // at most increase bits by 1.5 * average
            add = add.min(mean_bits * 3 / 4).max(0);
            if add + targ_bits[ch] > MAX_BITS_PER_CHANNEL as i32 {
                add = (MAX_BITS_PER_CHANNEL as i32 - targ_bits[ch]).max(0);
            }
            add_bits[ch] = add;
            bits += add;
        }
        if bits > extra_bits && bits > 0 {
            for add in add_bits.iter_mut() {
                *add = extra_bits * *add / bits;
            }
        }
        for ch in 0..pe.len() {
            targ_bits[ch] += add_bits[ch];
            extra_bits -= add_bits[ch];
        }

        let total: i32 = targ_bits[..pe.len()].iter().sum();
        if total > MAX_BITS_PER_GRANULE as i32 {
            for target in targ_bits[..pe.len()].iter_mut() {
                *target = *target * MAX_BITS_PER_GRANULE as i32 / total;
            }
        }
        max_bits
    }

    /// Take a finished granule's bits out of the reservoir
    pub fn adjust(&mut self, gi: &GranuleInfo) {
        self.resv_size -= gi.total_bits() as i32;
    }

    /// Close the frame: add its mean bits and drain stuffing
    ///
    /// Whole stuffing bytes are drained before the main data as far as
    /// `main_data_begin` allows; the rest goes after it. Records both drains
    /// in `side` and lowers `side.main_data_begin` by the bytes drained before.
    pub fn frame_end(&mut self, side: &mut SideInfo, mean_bits: i32, mode_gr: usize) {
        self.resv_size += mean_bits * mode_gr as i32;
        side.resv_drain_pre = 0;
        side.resv_drain_post = 0;

        // we must be byte aligned
        let mut stuffing_bits = self.resv_size % 8;
        let over_bits = (self.resv_size - stuffing_bits) - self.resv_max;
        if over_bits > 0 {
            stuffing_bits += over_bits;
        }

        let mdb_bytes = (side.main_data_begin as i32 * 8).min(stuffing_bits) / 8;
        side.resv_drain_pre = 8 * mdb_bytes as usize;
        stuffing_bits -= 8 * mdb_bytes;
        self.resv_size -= 8 * mdb_bytes;
        side.main_data_begin -= mdb_bytes as usize;

        side.resv_drain_post = stuffing_bits as usize;
        self.resv_size -= stuffing_bits;

        debug!(
            "reservoir {} bits (max {}), drained {} before and {} after main data",
            self.resv_size, self.resv_max, side.resv_drain_pre, side.resv_drain_post
        );
    }

    /// Empty the reservoir after its content has been padded out
    pub fn reset(&mut self) {
        self.resv_size = 0;
    }

    /// Overwrite the tracked size, used to recover from drift
    pub fn set_size(&mut self, bits: i32) {
        self.resv_size = bits;
    }

    /// Get current reservoir size
    pub fn reservoir_size(&self) -> i32 {
        self.resv_size
    }

    /// Get maximum reservoir size
    pub fn reservoir_max(&self) -> i32 {
        self.resv_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Channels, StereoMode, VbrMode};
    use proptest::prelude::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Keep proptest output short on failure
    fn setup_panic_hook() {
        INIT.call_once(|| {
            std::panic::set_hook(Box::new(|_| {
                eprintln!("Test failed: Property test assertion failed");
            }));
        });
    }

    fn config(sample_rate: u32, bitrate: u32, channels: u8) -> Config {
        let mut config = Config::default();
        config.wave.sample_rate = sample_rate;
        config.wave.channels = Channels::from(channels);
        config.mpeg.mode = if channels == 1 { StereoMode::Mono } else { StereoMode::JointStereo };
        config.mpeg.bitrate = bitrate;
        config.mpeg.vbr = VbrMode::Cbr;
        config
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            verbose: 0,
            max_shrink_iters: 0,
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn property_reservoir_limits(
            bitrate in prop::sample::select(&[32u32, 64, 128, 160, 256, 320]),
            sample_rate in prop::sample::select(&[44100u32, 48000, 32000]),
            channels in 1u8..=2,
        ) {
            setup_panic_hook();

            let config = config(sample_rate, bitrate, channels);
            let index = config.bitrate_index().unwrap();
            let mut reservoir = BitReservoir::new();
            let budget = reservoir.frame_begin(&config, index, false);

            prop_assert!(budget.mean_bits > 0, "Mean bits should be positive");
            prop_assert_eq!(reservoir.reservoir_max() % 8, 0);
            prop_assert!(reservoir.reservoir_max() <= 4088, "MPEG-1 max reservoir is 511 bytes");
            prop_assert_eq!(budget.full_frame_bits, budget.mean_bits * 2);
        }

        #[test]
        fn property_frame_end_keeps_byte_alignment(
            used in prop::collection::vec(0u32..=2000, 4),
            frames in 1usize..12,
        ) {
            setup_panic_hook();

            let config = config(44100, 128, 2);
            let index = config.bitrate_index().unwrap();
            let mut reservoir = BitReservoir::new();
            let mut side = SideInfo::default();

            for _ in 0..frames {
                let budget = reservoir.frame_begin(&config, index, false);
                let mut remaining = budget.full_frame_bits;
                for (k, &bits) in used.iter().enumerate() {
                    let mut gi = GranuleInfo::default();
                    gi.part2_3_length = (bits as i32).min(remaining).max(0) as u32;
                    remaining -= gi.part2_3_length as i32;
                    side.tt[k / 2][k % 2] = gi;
                    reservoir.adjust(&side.tt[k / 2][k % 2]);
                }
                let mdb_before = side.main_data_begin;
                reservoir.frame_end(&mut side, budget.mean_bits, 2);

                prop_assert!(reservoir.reservoir_size() >= 0);
                prop_assert_eq!(reservoir.reservoir_size() % 8, 0);
                prop_assert!(reservoir.reservoir_size() <= reservoir.reservoir_max());
                prop_assert!(side.resv_drain_pre / 8 <= mdb_before);
                side.main_data_begin = reservoir.reservoir_size() as usize / 8;
            }
        }

        #[test]
        fn property_on_pe_respects_channel_limits(
            pe in prop::collection::vec(0.0f32..=5000.0, 1..=2),
            resv in 0i32..=4088,
        ) {
            setup_panic_hook();

            let config = config(44100, 320, pe.len() as u8);
            let mut reservoir = BitReservoir::new();
            reservoir.set_size(resv / 8 * 8);
            let budget = reservoir.frame_begin(&config, 14, false);
            let mut targ = [0i32; 2];
            let max_bits = reservoir.on_pe(&pe, &mut targ, budget.mean_bits, false, false);

            prop_assert!(max_bits <= MAX_BITS_PER_GRANULE as i32);
            prop_assert!(targ[..pe.len()].iter().all(|&t| (0..=MAX_BITS_PER_CHANNEL as i32).contains(&t)));
            prop_assert!(targ[..pe.len()].iter().sum::<i32>() <= MAX_BITS_PER_GRANULE as i32);
        }
    }

    #[test]
    fn test_disabled_reservoir_has_no_room() {
        let mut config = config(44100, 128, 2);
        config.mpeg.disable_reservoir = true;
        let mut reservoir = BitReservoir::new();
        reservoir.frame_begin(&config, 9, false);
        assert_eq!(reservoir.reservoir_max(), 0);
    }

    #[test]
    fn test_unused_bits_fill_then_drain() {
        let config = config(44100, 128, 2);
        let mut reservoir = BitReservoir::new();
        let mut side = SideInfo::default();

        // silent frames: everything goes into the reservoir until it is full
        for _ in 0..4 {
            let budget = reservoir.frame_begin(&config, 9, false);
            reservoir.frame_end(&mut side, budget.mean_bits, 2);
            side.main_data_begin = reservoir.reservoir_size() as usize / 8;
        }
        assert_eq!(reservoir.reservoir_size(), reservoir.reservoir_max());
        assert!(side.resv_drain_pre > 0 || side.resv_drain_post > 0);
    }

    #[test]
    fn test_stuffing_drains_before_main_data_first() {
        let config = config(44100, 128, 2);
        let mut reservoir = BitReservoir::new();
        let budget = reservoir.frame_begin(&config, 9, false);
        reservoir.set_size(reservoir.reservoir_max());
        let mut side = SideInfo {
            main_data_begin: reservoir.reservoir_max() as usize / 8,
            ..SideInfo::default()
        };
        reservoir.frame_end(&mut side, budget.mean_bits, 2);

        assert_eq!(side.resv_drain_pre as i32, budget.mean_bits * 2 / 8 * 8);
        assert_eq!(reservoir.reservoir_size(), reservoir.reservoir_max());
        assert_eq!(side.main_data_begin, 511 - side.resv_drain_pre / 8);
        assert_eq!(side.resv_drain_post, 0);
    }
}
