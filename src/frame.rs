//! Frame orchestrator and flush
//!
//! `EncoderState` owns everything that lives across frames: the bit writer
//! with its header queue, the reservoir, the side information carrying
//! `main_data_begin`, the padding accumulator and the stream statistics.
//! One call to `encode_frame` turns the granules of one frame into bytes;
//! `flush` pads out the reservoir so every scheduled header reaches the
//! output.

use log::{debug, error, info, warn};

use crate::bitstream::BitStream;
use crate::config::{Config, VbrMode};
use crate::error::{ConfigError, EncoderError, EncoderResult, EncodingError, EncodingResult, InputDataError};
use crate::reservoir::BitReservoir;
use crate::scalefactors::{best_scalefac_store, scale_bitcount};
use crate::side_info::{render_side_info, FrameHeader};
use crate::spectral::write_main_data;
use crate::tables::{scalefactor_bands, ScalefactorBands};
use crate::takehiro::{best_huffman_divide, noquant_count_bits, BigValuesSplit};
use crate::types::{GranuleInfo, Masking, SideInfo, IXMAX_VAL, MAX_BITS_PER_CHANNEL, MAX_CHANNELS, MAX_GRANULES};
use crate::vbr::{is_analog_silence, vbr_encode_granules, SearchContext};

/// Tag written at the start of every stuffing drain
const ANCILLARY_TAG: &[u8; 4] = b"LAME";

/// Granules of one frame as delivered by the quantization stage
#[derive(Debug, Clone)]
pub struct FrameInput {
    /// `granules[gr][ch]`
    ///
    /// Without masking data the granules must already be quantized:
    /// `l3_enc`, `scalefac` and `global_gain` are coded as given.
    pub granules: Vec<Vec<GranuleInfo>>,
    /// Masking thresholds per granule and channel; when present the
    /// step-size search quantizes `xr` itself
    pub masking: Option<Vec<Vec<Masking>>>,
    /// Mid/side stereo in this frame
    pub ms_stereo: bool,
}

impl FrameInput {
    /// Frame of the given layout whose granules are all digital silence
    pub fn silence(config: &Config, bands: &ScalefactorBands) -> Self {
        let granule = GranuleInfo::new(Default::default(), bands);
        Self {
            granules: vec![vec![granule; config.channels()]; config.mode_gr()],
            masking: None,
            ms_stereo: false,
        }
    }
}

/// Bit accounting of one encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub struct FrameReport {
    /// Zero-based frame number
    pub frame: u64,
    pub bitrate_index: usize,
    pub padding: bool,
    /// Length of the frame in bits, header included
    pub frame_bits: usize,
    /// Scalefactor and Huffman bits of all granules
    pub main_data_bits: u64,
    /// `main_data_begin` as written in this frame's side information
    pub main_data_begin: usize,
    pub resv_drain_pre: usize,
    pub resv_drain_post: usize,
    /// Reservoir content after the frame
    pub reservoir_bits: i32,
    /// Bytes handed to the caller by this call
    pub output_bytes: usize,
    #[cfg(feature = "diagnostics")]
    pub created_at: String,
}

#[cfg(feature = "diagnostics")]
impl FrameReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Aggregate statistics of the stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize))]
pub struct StreamStats {
    /// Frames per bitrate index
    pub bitrate_histogram: [u64; 16],
    pub frames: u64,
    /// Bytes handed to the caller, flush padding included
    pub bytes: u64,
    /// Set once `flush` has written the last byte
    pub finalized: bool,
}

impl StreamStats {
    /// Frame-weighted mean bitrate in kbps
    pub fn average_bitrate(&self, config: &Config) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        let weighted: u64 = self
            .bitrate_histogram
            .iter()
            .enumerate()
            .skip(1)
            .take(14)
            .map(|(index, &count)| count * config.bitrate_of_index(index) as u64)
            .sum();
        weighted as f64 / self.frames as f64
    }
}

/// Encoding context of one stream
#[derive(Debug)]
pub struct EncoderState {
    config: Config,
    bands: &'static ScalefactorBands,
    split: BigValuesSplit,
    stream: BitStream,
    reservoir: BitReservoir,
    side: SideInfo,
    /// Bitrate indices a frame may use
    index_range: (usize, usize),
    /// Fractional slot accumulator for CBR padding
    slot_lag: i64,
    frac_slots: i64,
    /// Next filler bit of the ancillary area
    ancillary_flag: bool,
    stats: StreamStats,
}

impl EncoderState {
    /// Set up a stream; rejects parameters no frame could be encoded with
    pub fn new(config: Config) -> EncoderResult<Self> {
        config.validate()?;
        let bands = scalefactor_bands(config.wave.sample_rate)
            .ok_or(ConfigError::UnsupportedSampleRate(config.wave.sample_rate))?;
        let index_range = config
            .bitrate_index_range()
            .ok_or(ConfigError::UnsupportedBitrate(config.mpeg.bitrate))?;
        let frac_slots = config.frac_slots_per_frame() as i64;

        info!(
            "Layer III stream: {:?}, {} Hz, {} channel(s), bitrate indices {}..={}",
            config.mpeg_version(),
            config.wave.sample_rate,
            config.channels(),
            index_range.0,
            index_range.1
        );

        Ok(Self {
            split: BigValuesSplit::new(bands),
            bands,
            stream: BitStream::new(),
            reservoir: BitReservoir::new(),
            side: SideInfo::default(),
            index_range,
            slot_lag: frac_slots,
            frac_slots,
            ancillary_flag: false,
            stats: StreamStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Scalefactor band boundaries of the stream's sample rate
    pub fn bands(&self) -> &'static ScalefactorBands {
        self.bands
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Side information of the most recent frame
    pub fn side_info(&self) -> &SideInfo {
        &self.side
    }

    pub fn reservoir_size(&self) -> i32 {
        self.reservoir.reservoir_size()
    }

    /// Bits written since stream start, headers included
    pub fn total_bits(&self) -> u64 {
        self.stream.total_bits()
    }

    /// Bits still owed before every scheduled header and its frame are out
    pub fn compute_flushbits(&self) -> i64 {
        self.stream.headers.next_write_timing() as i64
            - self.stream.total_bits() as i64
            - self.stream.headers.pending_bits() as i64
    }

    /// Encode one frame and append the bytes completed so far to `out`
    pub fn encode_frame(&mut self, input: FrameInput, out: &mut Vec<u8>) -> EncoderResult<FrameReport> {
        let mut report = self.encode_frame_buffered(input)?;
        report.output_bytes = self.stream.writer.drain_into(out);
        self.stats.bytes += report.output_bytes as u64;
        Ok(report)
    }

    /// Encode one frame, leaving its bytes buffered for `copy_buffer`
    pub fn encode_frame_buffered(&mut self, input: FrameInput) -> EncoderResult<FrameReport> {
        self.load_input(input.granules)?;
        let masking = input.masking;
        if let Some(masking) = masking.as_deref() {
            self.check_masking_layout(masking)?;
        }

        let (bitrate_index, padding) = match (self.config.mpeg.vbr, masking.as_deref()) {
            (VbrMode::Vbr { .. }, Some(masking)) => (self.vbr_iteration_loop(masking)?, false),
            (VbrMode::Vbr { .. }, None) => return Err(InputDataError::MaskingLayout.into()),
            (VbrMode::Cbr, masking) => {
                let padding = self.next_padding();
                let index = self.index_range.0;
                match masking {
                    Some(masking) => self.cbr_iteration_loop(masking, index, padding)?,
                    None => self.encode_quantized(index, padding)?,
                }
                (index, padding)
            }
        };

        let header = FrameHeader {
            bitrate_index,
            padding,
            ms_stereo: input.ms_stereo,
        };
        let main_data_begin = self.side.main_data_begin;
        let main_data_bits = self.format_bitstream(&header)?;

        self.stats.bitrate_histogram[bitrate_index] += 1;
        self.stats.frames += 1;
        self.stats.finalized = false;

        Ok(FrameReport {
            frame: self.stats.frames - 1,
            bitrate_index,
            padding,
            frame_bits: self.config.frame_bits(bitrate_index, padding),
            main_data_bits,
            main_data_begin,
            resv_drain_pre: self.side.resv_drain_pre,
            resv_drain_post: self.side.resv_drain_post,
            reservoir_bits: self.reservoir.reservoir_size(),
            output_bytes: 0,
            #[cfg(feature = "diagnostics")]
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Copy all complete buffered bytes into `out`
    pub fn copy_buffer(&mut self, out: &mut [u8]) -> EncoderResult<usize> {
        let available = out.len();
        let copied = self
            .stream
            .writer
            .copy_buffer(out)
            .map_err(|required| EncoderError::BufferTooSmall { required, available })?;
        self.stats.bytes += copied as u64;
        Ok(copied)
    }

    /// Pad out the stream so every scheduled header and its frame are written
    ///
    /// Appends the remaining bytes to `out` and returns their count. A
    /// second flush without new frames adds nothing.
    pub fn flush(&mut self, out: &mut Vec<u8>) -> EncoderResult<usize> {
        let flush_bits = self.compute_flushbits();
        if flush_bits < 0 {
            error!("flush needs {} bits", flush_bits);
            return Err(EncodingError::NegativeFlushBits(flush_bits).into());
        }
        self.drain_into_ancillary(flush_bits as usize, true)?;

        // the reservoir content is now padding
        self.reservoir.reset();
        self.side.main_data_begin = 0;

        let written = self.stream.writer.drain_into(out);
        self.stats.bytes += written as u64;
        self.stats.finalized = true;
        debug!(
            "flushed {} bits, {} frames and {} bytes in total",
            flush_bits, self.stats.frames, self.stats.bytes
        );
        Ok(written)
    }

    /// Move the caller's granules into the side information
    fn load_input(&mut self, granules: Vec<Vec<GranuleInfo>>) -> EncoderResult<()> {
        let mode_gr = self.config.mode_gr();
        let nch = self.config.channels();
        if granules.len() != mode_gr || granules.iter().any(|row| row.len() != nch) {
            return Err(InputDataError::GranuleLayout {
                expected_granules: mode_gr,
                expected_channels: nch,
                granules: granules.len(),
                channels: granules.iter().map(Vec::len).find(|&len| len != nch).unwrap_or(nch),
            }
            .into());
        }

        self.side.scfsi = [[false; 4]; MAX_CHANNELS];
        for (gr, row) in granules.into_iter().enumerate() {
            for (ch, mut gi) in row.into_iter().enumerate() {
                gi.set_layout(self.bands);
                self.side.tt[gr][ch] = gi;
            }
        }
        Ok(())
    }

    fn check_masking_layout(&self, masking: &[Vec<Masking>]) -> EncoderResult<()> {
        let nch = self.config.channels();
        if masking.len() != self.config.mode_gr() || masking.iter().any(|row| row.len() != nch) {
            return Err(InputDataError::MaskingLayout.into());
        }
        Ok(())
    }

    /// Padding decision of the next CBR frame; the first frame is never padded
    fn next_padding(&mut self) -> bool {
        self.slot_lag -= self.frac_slots;
        if self.slot_lag < 0 {
            self.slot_lag += self.config.wave.sample_rate as i64;
            true
        } else {
            false
        }
    }

    fn search_context<'a>(config: &Config, bands: &'a ScalefactorBands, split: &'a BigValuesSplit) -> SearchContext<'a> {
        SearchContext {
            bands,
            split,
            version: config.mpeg_version(),
            effort: config.mpeg.search,
            channels: config.channels(),
        }
    }

    /// Code granules that arrive already quantized
    fn encode_quantized(&mut self, bitrate_index: usize, padding: bool) -> EncoderResult<()> {
        let budget = self.reservoir.frame_begin(&self.config, bitrate_index, padding);
        let version = self.config.mpeg_version();
        let mode_gr = self.config.mode_gr();
        let mut used = 0u64;

        for gr in 0..mode_gr {
            for ch in 0..self.config.channels() {
                let gi = &mut self.side.tt[gr][ch];
                if let Some((index, &value)) = gi.l3_enc.iter().enumerate().find(|(_, v)| !(0..=IXMAX_VAL).contains(*v)) {
                    return Err(InputDataError::QuantizedValueRange { index, value }.into());
                }
                gi.update_max_nonzero_coeff();
                noquant_count_bits(gi, self.bands, &self.split);
                let range_error = || InputDataError::ScalefactorRange { granule: gr, channel: ch };
                scale_bitcount(gi, version).ok_or_else(range_error)?;
                best_scalefac_store(&mut self.side, gr, ch, version).ok_or_else(range_error)?;

                let gi = &mut self.side.tt[gr][ch];
                best_huffman_divide(gi, self.bands, mode_gr);
                let bits = gi.total_bits();
                if bits as usize > MAX_BITS_PER_CHANNEL {
                    error!("granule {} channel {} needs {} bits", gr, ch, bits);
                    return Err(EncodingError::GranuleBitsExceeded {
                        granule: gr,
                        channel: ch,
                        bits,
                    }
                    .into());
                }
                self.reservoir.adjust(gi);
                used += bits as u64;
            }
        }

        if used > budget.full_frame_bits as u64 {
            error!("quantized frame needs {} bits, budget is {}", used, budget.full_frame_bits);
            return Err(EncodingError::FrameBitsExceeded {
                used,
                limit: budget.full_frame_bits as u64,
            }
            .into());
        }
        self.reservoir.frame_end(&mut self.side, budget.mean_bits, mode_gr);
        Ok(())
    }

    /// CBR frame quantized by the step-size search, one granule at a time
    fn cbr_iteration_loop(&mut self, masking: &[Vec<Masking>], bitrate_index: usize, padding: bool) -> EncoderResult<()> {
        let budget = self.reservoir.frame_begin(&self.config, bitrate_index, padding);
        let nch = self.config.channels();
        let disable = self.config.mpeg.disable_reservoir;
        let mut max_bits = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
        let mut used = 0i32;

        for gr in 0..self.config.mode_gr() {
            let pe: Vec<f32> = masking[gr].iter().map(|m| m.pe).collect();
            self.reservoir
                .on_pe(&pe, &mut max_bits[gr][..nch], budget.mean_bits, gr > 0, disable);

            let ctx = Self::search_context(&self.config, self.bands, &self.split);
            used += vbr_encode_granules(&ctx, &mut self.side, masking, gr..gr + 1, &max_bits)?;
            for gi in &self.side.tt[gr][..nch] {
                self.reservoir.adjust(gi);
            }
        }

        if used > budget.full_frame_bits {
            error!("CBR frame used {} bits, budget is {}", used, budget.full_frame_bits);
            return Err(EncodingError::FrameBitsExceeded {
                used: used as u64,
                limit: budget.full_frame_bits as u64,
            }
            .into());
        }
        self.reservoir.frame_end(&mut self.side, budget.mean_bits, self.config.mode_gr());
        Ok(())
    }

    /// VBR frame: search at the largest allowed budget, then pick the
    /// lowest bitrate that holds the result; returns the bitrate index
    fn vbr_iteration_loop(&mut self, masking: &[Vec<Masking>]) -> EncoderResult<usize> {
        let (min_index, max_index) = self.index_range;
        let mode_gr = self.config.mode_gr();
        let nch = self.config.channels();
        let disable = self.config.mpeg.disable_reservoir;

        let analog_silence = (0..mode_gr)
            .all(|gr| (0..nch).all(|ch| is_analog_silence(&self.side.tt[gr][ch], &masking[gr][ch])));
        let lowest = if analog_silence { 1 } else { min_index };

        let mut frame_bits = [0i32; 16];
        for (index, bits) in frame_bits.iter_mut().enumerate().take(max_index + 1).skip(lowest) {
            *bits = self.reservoir.frame_begin(&self.config, index, false).full_frame_bits;
        }
        let top = self.reservoir.frame_begin(&self.config, max_index, false);

        let mut max_bits = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
        for gr in 0..mode_gr {
            let pe: Vec<f32> = masking[gr].iter().map(|m| m.pe).collect();
            self.reservoir
                .on_pe(&pe, &mut max_bits[gr][..nch], top.mean_bits, false, disable);
            for ch in 0..nch {
                if self.side.tt[gr][ch].xr.iter().all(|&x| x == 0.0) {
                    max_bits[gr][ch] = 0;
                }
            }
        }
        let total: i32 = max_bits.iter().flat_map(|row| row[..nch].iter()).sum();
        if total > top.full_frame_bits {
            for bits in max_bits.iter_mut().flat_map(|row| row[..nch].iter_mut()) {
                *bits = (*bits as i64 * top.full_frame_bits as i64 / total as i64) as i32;
            }
        }

        let ctx = Self::search_context(&self.config, self.bands, &self.split);
        let used = vbr_encode_granules(&ctx, &mut self.side, masking, 0..mode_gr, &max_bits)?;

        let bitrate_index = (lowest..=max_index)
            .find(|&index| used <= frame_bits[index])
            .ok_or_else(|| {
                error!("VBR frame used {} bits, largest frame holds {}", used, frame_bits[max_index]);
                EncodingError::FrameBitsExceeded {
                    used: used as u64,
                    limit: frame_bits[max_index] as u64,
                }
            })?;

        let budget = self.reservoir.frame_begin(&self.config, bitrate_index, false);
        for gr in 0..mode_gr {
            for gi in &self.side.tt[gr][..nch] {
                self.reservoir.adjust(gi);
            }
        }
        self.reservoir.frame_end(&mut self.side, budget.mean_bits, mode_gr);
        debug!("VBR frame: {} bits at bitrate index {}", used, bitrate_index);
        Ok(bitrate_index)
    }

    /// Write stuffing bits: the tag, the crate version, then filler bits
    fn drain_into_ancillary(&mut self, bits: usize, stream_end: bool) -> EncodingResult<()> {
        let mut remaining = bits;
        for &byte in ANCILLARY_TAG {
            if remaining < 8 {
                break;
            }
            self.put_ancillary(byte as u32, 8, stream_end)?;
            remaining -= 8;
        }
        if remaining >= 32 {
            for &byte in env!("CARGO_PKG_VERSION").as_bytes() {
                if remaining < 8 {
                    break;
                }
                self.put_ancillary(byte as u32, 8, stream_end)?;
                remaining -= 8;
            }
        }
        while remaining > 0 {
            self.put_ancillary(self.ancillary_flag as u32, 1, stream_end)?;
            self.ancillary_flag ^= !self.config.mpeg.disable_reservoir;
            remaining -= 1;
        }
        Ok(())
    }

    /// At the end of the stream, bits past the last queued header skip the queue
    fn put_ancillary(&mut self, value: u32, width: u32, stream_end: bool) -> EncodingResult<()> {
        if stream_end && self.stream.headers.is_empty() {
            self.stream.put_bits_raw(value, width)
        } else {
            self.stream.put_bits(value, width)
        }
    }

    /// Emit the frame: drains, header and side information, main data;
    /// returns the main data bits
    fn format_bitstream(&mut self, header: &FrameHeader) -> EncodingResult<u64> {
        let bits_per_frame = self.config.frame_bits(header.bitrate_index, header.padding);

        self.drain_into_ancillary(self.side.resv_drain_pre, false)?;
        let side_info = render_side_info(&self.config, &mut self.side, header)?;
        self.stream.headers.schedule(&side_info, bits_per_frame)?;

        let main_data_bits = write_main_data(&mut self.stream, &self.config, &self.side, self.bands)?;
        self.drain_into_ancillary(self.side.resv_drain_post, false)?;
        let bits = 8 * side_info.len() as i64 + main_data_bits as i64 + self.side.resv_drain_post as i64;

        let main_data_begin = self.side.main_data_begin as i64 + (bits_per_frame as i64 - bits) / 8;
        let flush_bits = self.compute_flushbits();
        if main_data_begin < 0 || flush_bits != main_data_begin * 8 {
            error!(
                "stream holds {} unwritten bits but main_data_begin is {} bytes",
                flush_bits, main_data_begin
            );
            return Err(EncodingError::ReservoirMismatch {
                resv_size: main_data_begin * 8,
                stream_bits: flush_bits,
            });
        }
        self.side.main_data_begin = main_data_begin as usize;

        let resv_size = self.reservoir.reservoir_size() as i64;
        if resv_size != flush_bits {
            error!("reservoir tracks {} bits, stream holds {}", resv_size, flush_bits);
            warn!("resetting reservoir to {} bits", flush_bits);
            self.reservoir.set_size(flush_bits as i32);
        }

        let total = self.stream.total_bits();
        if !self.stream.writer.is_byte_aligned() {
            error!("frame ends at bit {}, not on a byte boundary", total);
            return Err(EncodingError::BitCountMismatch {
                expected: total.next_multiple_of(8),
                actual: total,
            });
        }

        debug!(
            "frame at bitrate index {}{}: {} main data bits, main_data_begin {}, reservoir {}",
            header.bitrate_index,
            if header.padding { " (padded)" } else { "" },
            main_data_bits,
            self.side.main_data_begin,
            self.reservoir.reservoir_size()
        );
        Ok(main_data_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Channels, StereoMode};
    use crate::types::BlockType;
    use proptest::prelude::*;

    fn stereo_cbr() -> Config {
        Config::default()
    }

    fn mono_config(sample_rate: u32, bitrate: u32, vbr: VbrMode) -> Config {
        let mut config = Config::default();
        config.wave.channels = Channels::Mono;
        config.wave.sample_rate = sample_rate;
        config.mpeg.mode = StereoMode::Mono;
        config.mpeg.bitrate = bitrate;
        config.mpeg.vbr = vbr;
        config
    }

    fn noisy_granule(bands: &ScalefactorBands, amplitude: f32, seed: u32) -> GranuleInfo {
        let mut gi = GranuleInfo::new(BlockType::Normal, bands);
        let mut state = seed | 1;
        for (i, x) in gi.xr.iter_mut().enumerate() {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let noise = ((state >> 16) % 2001) as f32 / 1000.0 - 1.0;
            *x = amplitude * noise / (1.0 + i as f32 / 24.0);
        }
        gi
    }

    fn masking_for(gi: &GranuleInfo, ratio: f32, pe: f32) -> Masking {
        let mut masking = Masking::default();
        let mut start = 0;
        for sfb in 0..gi.slots() {
            let end = start + gi.width[sfb];
            let energy: f32 = gi.xr[start..end].iter().map(|x| x * x).sum();
            masking.l3_xmin[sfb] = energy * ratio;
            start = end;
        }
        masking.pe = pe;
        masking
    }

    #[test]
    fn test_padding_follows_slot_lag() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        let pattern: Vec<bool> = (0..8).map(|_| state.next_padding()).collect();
        assert!(!pattern[0]);
        // 44.1 kHz at 128 kbps pads 42300 of every 44100 frames
        assert!(pattern[1..].iter().all(|&padded| padded));
    }

    #[test]
    fn test_silent_frame_keeps_reservoir_in_step() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        let input = FrameInput::silence(state.config(), state.bands());
        let mut out = Vec::new();
        let report = state.encode_frame(input, &mut out).unwrap();

        assert_eq!(report.main_data_bits, 0);
        assert_eq!(report.frame_bits, 417 * 8);
        // (3336 - 8 * 36) bits of mean budget went unused
        assert_eq!(state.reservoir_size(), 3048);
        assert_eq!(state.compute_flushbits(), 3048);
        assert_eq!(state.side_info().main_data_begin, 381);
    }

    #[test]
    fn test_drain_writes_tag_then_version() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        state.drain_into_ancillary(64, false).unwrap();
        let mut out = Vec::new();
        state.stream.writer.drain_into(&mut out);

        let version = env!("CARGO_PKG_VERSION").as_bytes();
        assert_eq!(&out[..4], b"LAME");
        let shown = version.len().min(4);
        assert_eq!(&out[4..4 + shown], &version[..shown]);
    }

    #[test]
    fn test_filler_bits_alternate() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        state.drain_into_ancillary(8 * 4 + 8, false).unwrap();
        let mut out = Vec::new();
        state.stream.writer.drain_into(&mut out);
        assert_eq!(out[4], 0b0101_0101);
    }

    #[test]
    fn test_layout_mismatch_is_rejected() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        let mut input = FrameInput::silence(state.config(), state.bands());
        input.granules[1].pop();
        let result = state.encode_frame(input, &mut Vec::new());
        assert!(matches!(
            result,
            Err(EncoderError::InputData(InputDataError::GranuleLayout { channels: 1, .. }))
        ));
    }

    #[test]
    fn test_out_of_range_value_is_rejected() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        let mut input = FrameInput::silence(state.config(), state.bands());
        input.granules[0][1].l3_enc[3] = IXMAX_VAL + 1;
        let result = state.encode_frame(input, &mut Vec::new());
        assert!(matches!(
            result,
            Err(EncoderError::InputData(InputDataError::QuantizedValueRange { index: 3, .. }))
        ));
    }

    #[test]
    fn test_granule_over_field_limit_is_rejected() {
        let config = mono_config(44100, 320, VbrMode::Cbr);
        let mut state = EncoderState::new(config).unwrap();
        let mut input = FrameInput::silence(state.config(), state.bands());
        // Fits the 320 kbps frame as a whole but not one 12-bit length field
        for (i, value) in input.granules[0][0].l3_enc.iter_mut().enumerate() {
            *value = if i % 2 == 0 { 40 } else { 30 };
        }
        let mut out = Vec::new();
        let result = state.encode_frame(input, &mut out);
        assert!(matches!(
            result,
            Err(EncoderError::Encoding(EncodingError::GranuleBitsExceeded { granule: 0, channel: 0, bits }))
                if bits > 4095
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_vbr_without_masking_is_rejected() {
        let config = mono_config(22050, 64, VbrMode::Vbr { min_bitrate: 32, max_bitrate: 128 });
        let mut state = EncoderState::new(config).unwrap();
        let input = FrameInput::silence(state.config(), state.bands());
        assert!(matches!(
            state.encode_frame(input, &mut Vec::new()),
            Err(EncoderError::InputData(InputDataError::MaskingLayout))
        ));
    }

    #[test]
    fn test_vbr_silence_drops_to_lowest_bitrate() {
        let config = mono_config(22050, 64, VbrMode::Vbr { min_bitrate: 32, max_bitrate: 128 });
        let mut state = EncoderState::new(config).unwrap();
        let mut input = FrameInput::silence(state.config(), state.bands());
        input.masking = Some(vec![vec![Masking::default()]]);
        let report = state.encode_frame(input, &mut Vec::new()).unwrap();
        assert_eq!(report.bitrate_index, 1);
        assert_eq!(state.stats().bitrate_histogram[1], 1);
    }

    #[test]
    fn test_copy_buffer_reports_required_size() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        state.drain_into_ancillary(64, false).unwrap();
        let mut small = [0u8; 4];
        assert!(matches!(
            state.copy_buffer(&mut small),
            Err(EncoderError::BufferTooSmall { required: 8, available: 4 })
        ));
        let mut large = [0u8; 16];
        assert_eq!(state.copy_buffer(&mut large).unwrap(), 8);
    }

    #[test]
    fn test_flush_splices_queued_headers_then_pads() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        let mut out = Vec::new();
        for _ in 0..3 {
            let input = FrameInput::silence(state.config(), state.bands());
            state.encode_frame(input, &mut out).unwrap();
        }
        // silent frames only grow the reservoir, so headers are still queued
        assert!(!state.stream.headers.is_empty());

        state.flush(&mut out).unwrap();
        assert!(state.stream.headers.is_empty());
        assert_eq!(state.compute_flushbits(), 0);
        assert_eq!(out.len(), 417 + 418 + 418);
        assert_eq!(&out[..2], &[0xff, 0xfb]);
        assert_eq!(&out[417..419], &[0xff, 0xfb]);
        assert_eq!(&out[835..837], &[0xff, 0xfb]);
    }

    #[test]
    fn test_flush_on_empty_stream_writes_nothing() {
        let mut state = EncoderState::new(stereo_cbr()).unwrap();
        let mut out = Vec::new();
        assert_eq!(state.flush(&mut out).unwrap(), 0);
        assert!(out.is_empty());
        assert!(state.stats().finalized);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 8,
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn property_reservoir_tracks_stream(
            amplitudes in prop::collection::vec(0.0f32..20000.0, 1..6),
            ratio in 1e-4f32..0.1,
            pe in 100.0f32..2000.0,
            vbr in any::<bool>(),
        ) {
            let mode = if vbr { VbrMode::Vbr { min_bitrate: 32, max_bitrate: 256 } } else { VbrMode::Cbr };
            let config = Config {
                mpeg: crate::config::MpegConfig { vbr: mode, ..Config::default().mpeg },
                ..Config::default()
            };
            let mut state = EncoderState::new(config).unwrap();
            let bands = state.bands();
            let mut out = Vec::new();

            for (frame, &amplitude) in amplitudes.iter().enumerate() {
                let granules: Vec<Vec<GranuleInfo>> = (0..2)
                    .map(|gr| (0..2).map(|ch| noisy_granule(bands, amplitude, (frame * 4 + gr * 2 + ch) as u32)).collect())
                    .collect();
                let masking = granules
                    .iter()
                    .map(|row| row.iter().map(|gi| masking_for(gi, ratio, pe)).collect())
                    .collect();
                let input = FrameInput { granules, masking: Some(masking), ms_stereo: false };
                state.encode_frame(input, &mut out).unwrap();

                prop_assert_eq!(state.total_bits() % 8, 0);
                prop_assert_eq!(state.compute_flushbits(), state.reservoir_size() as i64);
                prop_assert_eq!(state.side_info().main_data_begin as i64 * 8, state.reservoir_size() as i64);
            }

            state.flush(&mut out).unwrap();
            prop_assert_eq!(state.reservoir_size(), 0);
            prop_assert_eq!(out.len() as u64 * 8, state.total_bits());
        }
    }
}
