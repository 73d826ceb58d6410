//! VBR step-size search
//!
//! For every granule and channel the search first finds, band by band, the
//! coarsest quantizer step whose noise stays under the masking threshold
//! (`block_sf`). The per-block-type constraint functions turn that step
//! profile into a global gain plus scalefactors the bitstream can carry.
//! The result is quantized and counted; if the frame does not fit its bit
//! limits, the budget is renegotiated between granules and channels and
//! each over-budget granule is coarsened until it fits.
//!
//! Every search loop is a fixed number of halvings, so a granule costs a
//! bounded number of quantize-and-count passes.

use std::ops::Range;

use lazy_static::lazy_static;
use log::{debug, error, trace, warn};

use crate::config::{MpegVersion, SearchEffort};
use crate::error::{EncodingError, EncodingResult};
use crate::scalefactors::{best_scalefac_store, scale_bitcount};
use crate::tables::{ScalefactorBands, MAX_RANGE_LONG, MAX_RANGE_LONG_LSF_PRETAB, MAX_RANGE_SHORT, PRETAB};
use crate::takehiro::{best_huffman_divide, noquant_count_bits, BigValuesSplit};
use crate::types::{
    BlockType, GranuleInfo, Masking, Scalefactor, SideInfo, GRANULE_SIZE, IXMAX_VAL, MAX_BITS_PER_CHANNEL,
    MAX_BITS_PER_GRANULE, MAX_CHANNELS, MAX_GRANULES, SFBMAX,
};

/// Step-size table length
const Q_MAX: usize = 257;
/// Offset for negative step sizes in `POW20`
const Q_MAX2: usize = 116;
/// Entries of the x^(4/3) table
const PRECALC_SIZE: usize = IXMAX_VAL as usize + 2;

lazy_static! {
    /// 2^(-(sf - 210) * 3/16): scales xr^(3/4) onto the quantizer grid
    static ref IPOW20: Vec<f32> = (0..Q_MAX)
        .map(|i| 2f64.powf(-(i as f64 - 210.0) * 0.1875) as f32)
        .collect();

    /// 2^((sf - 210) / 4): the step size itself
    static ref POW20: Vec<f32> = (0..Q_MAX + Q_MAX2 + 1)
        .map(|i| 2f64.powf((i as f64 - 210.0 - Q_MAX2 as f64) * 0.25) as f32)
        .collect();

    static ref POW43: Vec<f32> = (0..PRECALC_SIZE)
        .map(|i| (i as f64).powf(4.0 / 3.0) as f32)
        .collect();

    /// Rounding offsets that minimize the reconstruction error
    static ref ADJ43: Vec<f32> = {
        let mut adj = vec![0.5f32; PRECALC_SIZE];
        for (i, slot) in adj.iter_mut().enumerate().take(PRECALC_SIZE - 1) {
            let p0 = (i as f64).powf(4.0 / 3.0);
            let p1 = ((i + 1) as f64).powf(4.0 / 3.0);
            *slot = ((i + 1) as f64 - (0.5 * (p0 + p1)).powf(0.75)) as f32;
        }
        adj
    };
}

#[inline]
fn ipow20(sf: i32) -> f32 {
    IPOW20[sf.clamp(0, Q_MAX as i32 - 1) as usize]
}

#[inline]
fn pow20(sf: i32) -> f32 {
    POW20[(sf + Q_MAX2 as i32).clamp(0, (Q_MAX + Q_MAX2) as i32) as usize]
}

/// Quantize a value already scaled onto the grid
#[inline]
fn quantize_value(x: f32) -> i32 {
    let index = (x as usize).min(PRECALC_SIZE - 1);
    (x + ADJ43[index]) as i32
}

/// |xr|^(3/4) of a spectrum
pub fn xr_pow34(xr: &[f32]) -> Vec<f32> {
    xr.iter().map(|&x| x.abs().sqrt() * x.abs().sqrt().sqrt()).collect()
}

/// Fixed inputs shared by all granules of a stream
#[derive(Debug, Clone, Copy)]
pub struct SearchContext<'a> {
    pub bands: &'a ScalefactorBands,
    pub split: &'a BigValuesSplit,
    pub version: MpegVersion,
    pub effort: SearchEffort,
    pub channels: usize,
}

impl SearchContext<'_> {
    fn mode_gr(&self) -> usize {
        self.version.granules()
    }
}

/// Smallest step that keeps a band's largest value within `IXMAX_VAL`
fn find_lowest_scalefac(max_xr34: f32) -> i32 {
    let (mut sf, mut delsf, mut sf_ok) = (128, 64, 255);
    for _ in 0..8 {
        if ipow20(sf) * max_xr34 <= IXMAX_VAL as f32 {
            sf_ok = sf;
            sf -= delsf;
        } else {
            sf += delsf;
        }
        delsf >>= 1;
    }
    sf_ok
}

/// Quantization noise energy of a band at step `sf`
fn calc_sfb_noise_x34(xr: &[f32], xr34: &[f32], sf: i32) -> f32 {
    let sfpow = pow20(sf);
    let sfpow34 = ipow20(sf);
    xr.iter()
        .zip(xr34)
        .map(|(&x, &x34)| {
            let l3 = quantize_value(sfpow34 * x34).clamp(0, PRECALC_SIZE as i32 - 1);
            let d = x.abs() - sfpow * POW43[l3 as usize];
            d * d
        })
        .sum()
}

/// Noise evaluations of one band, keyed by step size
struct NoiseCache {
    values: [Option<f32>; 256],
}

impl NoiseCache {
    fn new() -> Self {
        Self { values: [None; 256] }
    }

    fn noise(&mut self, xr: &[f32], xr34: &[f32], sf: i32) -> f32 {
        *self.values[sf as usize].get_or_insert_with(|| calc_sfb_noise_x34(xr, xr34, sf))
    }

    /// True when `sf` or a neighbour exceeds the allowed noise
    fn too_noisy(&mut self, xr: &[f32], xr34: &[f32], l3_xmin: f32, sf: i32) -> bool {
        if l3_xmin < self.noise(xr, xr34, sf) {
            return true;
        }
        if sf < 255 && l3_xmin < self.noise(xr, xr34, sf + 1) {
            return true;
        }
        sf > 0 && l3_xmin < self.noise(xr, xr34, sf - 1)
    }
}

/// Largest step whose noise stays under `l3_xmin`
fn find_scalefac_x34(xr: &[f32], xr34: &[f32], l3_xmin: f32, sf_min: i32) -> i32 {
    let mut cache = NoiseCache::new();
    let (mut sf, mut sf_ok, mut delsf) = (128, 255, 128);
    let mut seen_good_one = false;

    for _ in 0..8 {
        delsf >>= 1;
        if sf <= sf_min {
            sf += delsf;
        } else if cache.too_noisy(xr, xr34, l3_xmin, sf) {
            sf -= delsf;
        } else {
            sf_ok = sf;
            sf += delsf;
            seen_good_one = true;
        }
    }
    if seen_good_one {
        sf = sf_ok;
    }
    sf.max(sf_min)
}

/// Closed-form step estimate from the allowed noise per line
fn guess_scalefac_x34(l3_xmin: f32, bw: usize, sf_min: i32) -> i32 {
    const C: f32 = 5.799_142_4; // 10 * 10^(2/3) * log10(4/3)
    let estimate = (C * (l3_xmin / bw as f32).log10() - 0.5).clamp(-1000.0, 1000.0);
    let guess = 210 + estimate as i32;
    guess.clamp(sf_min, 255)
}

/// Search state of one granule and channel
#[derive(Debug, Clone)]
struct GranuleSearch {
    xr34: Vec<f32>,
    mingain_l: i32,
    mingain_s: [i32; 3],
    sfwork: [i32; SFBMAX],
    vbrsfmin: [i32; SFBMAX],
    /// False for silent granules, which are coded as all zero
    active: bool,
}

impl GranuleSearch {
    fn new(gi: &GranuleInfo, max_bits: i32) -> Self {
        let xr34 = xr_pow34(&gi.xr);
        let active = max_bits > 0 && xr34.iter().any(|&x| x > 1e-20);
        Self {
            xr34,
            mingain_l: 0,
            mingain_s: [0; 3],
            sfwork: [0; SFBMAX],
            vbrsfmin: [0; SFBMAX],
            active,
        }
    }

    /// Per-band step sizes; returns the largest
    fn block_sf(&mut self, gi: &GranuleInfo, l3_xmin: &[f32; SFBMAX], effort: SearchEffort) -> i32 {
        let max_nonzero = gi.max_nonzero_coeff;
        let mut maxsf = 0;
        let mut m_o = -1;
        let (mut sfb, mut j, mut window) = (0, 0, 0);
        self.mingain_l = 0;
        self.mingain_s = [0; 3];

        while j <= max_nonzero && sfb < SFBMAX {
            let w = gi.width[sfb];
            let l = w.min(max_nonzero - j + 1);
            let xr = &gi.xr[j..j + l];
            let xr34 = &self.xr34[j..j + l];

            let max_xr34 = xr34.iter().copied().fold(0.0f32, f32::max);
            let m1 = find_lowest_scalefac(max_xr34);
            self.vbrsfmin[sfb] = m1;
            self.mingain_l = self.mingain_l.max(m1);
            self.mingain_s[window] = self.mingain_s[window].max(m1);
            window = (window + 1) % 3;

            let energy: f32 = gi.xr[j..j + w].iter().map(|x| x * x).sum();
            let m2 = if sfb < gi.psymax && w > 2 && energy > l3_xmin[sfb] {
                let m2 = match effort {
                    SearchEffort::Full => find_scalefac_x34(xr, xr34, l3_xmin[sfb], m1),
                    SearchEffort::Fast => guess_scalefac_x34(l3_xmin[sfb], l, m1),
                };
                maxsf = maxsf.max(m2);
                if m_o < m2 && m2 < 255 {
                    m_o = m2;
                }
                m2
            } else {
                maxsf = 255;
                255
            };
            self.sfwork[sfb] = m2;
            sfb += 1;
            j += w;
        }
        for slot in sfb..SFBMAX {
            self.sfwork[slot] = maxsf;
            self.vbrsfmin[slot] = 0;
        }
        if m_o > -1 {
            maxsf = m_o;
            for sf in self.sfwork.iter_mut() {
                if *sf == 255 {
                    *sf = m_o;
                }
            }
        }
        trace!("block_sf: max step {}, min gain {}", maxsf, self.mingain_l);
        maxsf
    }

    /// Turn a step profile into global gain, subblock gains and scalefactors
    fn alloc(&self, gi: &mut GranuleInfo, vbrsf: &[i32; SFBMAX], vbrmax: i32, mode_gr: usize) {
        if gi.block_type == BlockType::Short {
            self.short_block_constrain(gi, vbrsf, vbrmax);
        } else {
            self.long_block_constrain(gi, vbrsf, vbrmax, mode_gr);
        }
    }

    fn short_block_constrain(&self, gi: &mut GranuleInfo, vbrsf: &[i32; SFBMAX], mut vbrmax: i32) {
        let (mut maxover0, mut maxover1, mut delta) = (0, 0, 0);
        for sfb in 0..gi.psymax {
            let v = vbrmax - vbrsf[sfb];
            delta = delta.max(v);
            maxover0 = maxover0.max(v - (4 * 14 + 2 * MAX_RANGE_SHORT[sfb]));
            maxover1 = maxover1.max(v - (4 * 14 + 4 * MAX_RANGE_SHORT[sfb]));
        }
        let mover = maxover0.min(maxover1);
        vbrmax -= delta.min(mover);
        maxover0 -= mover;
        maxover1 -= mover;
        if maxover0 == 0 {
            gi.scalefac_scale = false;
        } else if maxover1 == 0 {
            gi.scalefac_scale = true;
        }
        vbrmax = vbrmax.max(self.mingain_l);
        gi.global_gain = vbrmax.clamp(0, 255);

        let mut sf_temp = [0i32; SFBMAX];
        for (temp, &sf) in sf_temp.iter_mut().zip(vbrsf) {
            *temp = sf - vbrmax;
        }
        set_subblock_gain(gi, &self.mingain_s, &mut sf_temp);
        set_scalefacs(gi, &self.vbrsfmin, &mut sf_temp, &MAX_RANGE_SHORT);
    }

    fn long_block_constrain(&self, gi: &mut GranuleInfo, vbrsf: &[i32; SFBMAX], mut vbrmax: i32, mode_gr: usize) {
        let max_rangep: &[i32; 22] = if mode_gr == 2 { &MAX_RANGE_LONG } else { &MAX_RANGE_LONG_LSF_PRETAB };
        let psymax = gi.psymax;
        let (mut maxover0, mut maxover1, mut maxover0p, mut maxover1p, mut delta) = (0, 0, 0, 0, 0);

        for sfb in 0..psymax {
            let v = vbrmax - vbrsf[sfb];
            delta = delta.max(v);
            maxover0 = maxover0.max(v - 2 * MAX_RANGE_LONG[sfb]);
            maxover1 = maxover1.max(v - 4 * MAX_RANGE_LONG[sfb]);
            maxover0p = maxover0p.max(v - 2 * (max_rangep[sfb] + PRETAB[sfb]));
            maxover1p = maxover1p.max(v - 4 * (max_rangep[sfb] + PRETAB[sfb]));
        }

        // pre-emphasis is only usable when every band keeps room below its gain
        let preflag_fits = |maxover: i32, step: i32| {
            let gain = (vbrmax - maxover).max(self.mingain_l);
            (0..psymax).all(|sfb| gain - self.vbrsfmin[sfb] - step * PRETAB[sfb] > 0)
        };
        let vm0p = preflag_fits(maxover0p, 2);
        let vm1p = vm0p && preflag_fits(maxover1p, 4);
        if !vm0p {
            maxover0p = maxover0;
        }
        if !vm1p {
            maxover1p = maxover1;
        }

        let mover = maxover0.min(maxover0p).min(maxover1).min(maxover1p);
        vbrmax -= delta.min(mover);
        vbrmax = vbrmax.max(self.mingain_l);
        maxover0 -= mover;
        maxover0p -= mover;
        maxover1 -= mover;
        maxover1p -= mover;

        let max_range = if maxover0 == 0 {
            gi.scalefac_scale = false;
            gi.preflag = false;
            &MAX_RANGE_LONG
        } else if maxover0p == 0 {
            gi.scalefac_scale = false;
            gi.preflag = true;
            max_rangep
        } else if maxover1 == 0 {
            gi.scalefac_scale = true;
            gi.preflag = false;
            &MAX_RANGE_LONG
        } else if maxover1p == 0 {
            gi.scalefac_scale = true;
            gi.preflag = true;
            max_rangep
        } else {
            warn!("no scalefactor layout covers the step profile, using scalefac_scale");
            gi.scalefac_scale = true;
            gi.preflag = false;
            &MAX_RANGE_LONG
        };
        gi.global_gain = vbrmax.clamp(0, 255);

        let mut sf_temp = [0i32; SFBMAX];
        for (temp, &sf) in sf_temp.iter_mut().zip(vbrsf) {
            *temp = sf - vbrmax;
        }
        set_scalefacs(gi, &self.vbrsfmin, &mut sf_temp, max_range);
    }

    /// Quantize with the granule's current gains
    fn quantize(&self, gi: &mut GranuleInfo) {
        let ifqstep = if gi.scalefac_scale { 4 } else { 2 };
        let max_nonzero = gi.max_nonzero_coeff;
        gi.l3_enc = [0; GRANULE_SIZE];
        if !self.active {
            return;
        }

        let (mut j, mut sfb) = (0, 0);
        while j <= max_nonzero && sfb < SFBMAX {
            let pre = if gi.preflag && sfb < PRETAB.len() { PRETAB[sfb] } else { 0 };
            let s = (gi.scalefac[sfb].magnitude() + pre) * ifqstep + gi.subblock_gain[gi.window[sfb]] * 8;
            let sfpow34 = ipow20((gi.global_gain - s).clamp(0, 255));
            let w = gi.width[sfb];
            let l = w.min(max_nonzero - j + 1);
            for i in j..j + l {
                gi.l3_enc[i] = quantize_value(sfpow34 * self.xr34[i]);
            }
            j += w;
            sfb += 1;
        }
    }

    fn quantize_and_count_bits(&self, gi: &mut GranuleInfo, ctx: &SearchContext) -> u32 {
        self.quantize(gi);
        noquant_count_bits(gi, ctx.bands, ctx.split)
    }

    fn bitcount(gi: &mut GranuleInfo, version: MpegVersion) -> EncodingResult<u32> {
        scale_bitcount(gi, version).ok_or_else(|| {
            error!("step-size search produced scalefactors no scalefac_compress can hold");
            EncodingError::ScalefactorAllocation
        })
    }

    /// Bits of the granule for a step profile, scalefactors included
    fn try_that_one(&self, gi: &mut GranuleInfo, ctx: &SearchContext, sftemp: &[i32; SFBMAX], vbrmax: i32) -> EncodingResult<u32> {
        self.alloc(gi, sftemp, vbrmax, ctx.mode_gr());
        Self::bitcount(gi, ctx.version)?;
        Ok(self.quantize_and_count_bits(gi, ctx) + gi.part2_length)
    }

    /// Huffman bits after moving the whole profile by `delta`
    fn try_global_stepsize(&self, gi: &mut GranuleInfo, ctx: &SearchContext, sfwork: &[i32; SFBMAX], delta: i32) -> EncodingResult<u32> {
        let mut sftemp = [0i32; SFBMAX];
        let mut vbrmax = 0;
        for i in 0..SFBMAX {
            let gain = (sfwork[i] + delta).max(self.vbrsfmin[i]).min(255);
            vbrmax = vbrmax.max(gain);
            sftemp[i] = gain;
        }
        self.alloc(gi, &sftemp, vbrmax, ctx.mode_gr());
        Self::bitcount(gi, ctx.version)?;
        Ok(self.quantize_and_count_bits(gi, ctx))
    }

    fn search_global_stepsize_max(&self, gi: &mut GranuleInfo, ctx: &SearchContext, sfwork: &[i32; SFBMAX], target: i32) -> EncodingResult<()> {
        let gain = gi.global_gain;
        let (mut l, mut r) = (gain, 512);
        let mut curr = gain;
        let mut gain_ok = 1024;

        while l <= r {
            curr = (l + r) >> 1;
            let nbits = self.try_global_stepsize(gi, ctx, sfwork, curr - gain)?;
            if nbits == 0 || ((nbits + gi.part2_length) as i32) < target {
                r = curr - 1;
                gain_ok = curr;
            } else {
                l = curr + 1;
                if gain_ok == 1024 {
                    gain_ok = curr;
                }
            }
        }
        if gain_ok != curr {
            self.try_global_stepsize(gi, ctx, sfwork, gain_ok - gain)?;
        }
        Ok(())
    }

    /// Coarsen the profile until the granule fits `target` bits
    ///
    /// First blends each band toward the global gain (binary search over the
    /// blend weight), then raises the ceiling of a fully flattened profile,
    /// and finally shifts the whole profile up.
    fn out_of_bits_strategy(&self, gi: &mut GranuleInfo, ctx: &SearchContext, sfwork: &[i32; SFBMAX], target: i32) -> EncodingResult<()> {
        let mut wrk = [0i32; SFBMAX];
        let dm = sf_depth(sfwork);
        let p = gi.global_gain;

        // part 1: blend toward the gain
        let (mut bi, mut bi_ok, mut bu, mut bo) = (dm / 2, -1, 0, dm);
        loop {
            let sfmax = flatten_distribution(sfwork, &mut wrk, dm, bi, p);
            let nbits = self.try_that_one(gi, ctx, &wrk, sfmax)? as i32;
            trace!("out of bits, part 1: blend {} of {} uses {} bits", bi, dm, nbits);
            if nbits <= target {
                bi_ok = bi;
                bo = bi - 1;
            } else {
                bu = bi + 1;
            }
            if bu <= bo {
                bi = (bu + bo) / 2;
            } else {
                break;
            }
        }
        if bi_ok >= 0 {
            if bi != bi_ok {
                let sfmax = flatten_distribution(sfwork, &mut wrk, dm, bi_ok, p);
                self.try_that_one(gi, ctx, &wrk, sfmax)?;
            }
            return Ok(());
        }

        // part 2: flatten fully and raise the ceiling
        let (mut bi, mut bi_ok, mut bu, mut bo) = ((255 + p) / 2, -1, p, 255);
        loop {
            let sfmax = flatten_distribution(sfwork, &mut wrk, dm, dm, bi);
            let nbits = self.try_that_one(gi, ctx, &wrk, sfmax)? as i32;
            trace!("out of bits, part 2: ceiling {} uses {} bits", bi, nbits);
            if nbits <= target {
                bi_ok = bi;
                bo = bi - 1;
            } else {
                bu = bi + 1;
            }
            if bu <= bo {
                bi = (bu + bo) / 2;
            } else {
                break;
            }
        }
        if bi_ok >= 0 {
            if bi != bi_ok {
                let sfmax = flatten_distribution(sfwork, &mut wrk, dm, dm, bi_ok);
                self.try_that_one(gi, ctx, &wrk, sfmax)?;
            }
            return Ok(());
        }

        self.search_global_stepsize_max(gi, ctx, &wrk, target)
    }
}

fn set_subblock_gain(gi: &mut GranuleInfo, mingain_s: &[i32; 3], sf: &mut [i32; SFBMAX]) {
    const MAX_RANGE1: i32 = 15;
    const MAX_RANGE2: i32 = 7;
    let ifqstep_shift = if gi.scalefac_scale { 2 } else { 1 };
    let psydiv = gi.psymax.min(18);
    let mut min_sbg = 7;

    for i in 0..3 {
        let (mut maxsf1, mut maxsf2, mut minsf) = (0, 0, 1000);
        for sfb in (i..psydiv).step_by(3) {
            let v = -sf[sfb];
            maxsf1 = maxsf1.max(v);
            minsf = minsf.min(v);
        }
        let part2_start = i + (psydiv.saturating_sub(i) + 2) / 3 * 3;
        for sfb in (part2_start..SFBMAX).step_by(3) {
            let v = -sf[sfb];
            maxsf2 = maxsf2.max(v);
            minsf = minsf.min(v);
        }

        // boost subblock gain as little as possible
        let maxsf = (maxsf1 - (MAX_RANGE1 << ifqstep_shift)).max(maxsf2 - (MAX_RANGE2 << ifqstep_shift));
        let mut sbg = if minsf > 0 { minsf >> 3 } else { 0 };
        if maxsf > 0 {
            sbg = sbg.max((maxsf + 7) >> 3);
        }
        if sbg > 0 && mingain_s[i] > gi.global_gain - sbg * 8 {
            sbg = (gi.global_gain - mingain_s[i]) >> 3;
        }
        sbg = sbg.clamp(0, 7);
        gi.subblock_gain[i] = sbg;
        min_sbg = min_sbg.min(sbg);
    }

    for (slot, value) in sf.iter_mut().enumerate() {
        *value += gi.subblock_gain[slot % 3] * 8;
    }
    if min_sbg > 0 {
        for sbg in gi.subblock_gain.iter_mut() {
            *sbg -= min_sbg;
        }
        gi.global_gain -= min_sbg * 8;
    }
}

fn set_scalefacs(gi: &mut GranuleInfo, vbrsfmin: &[i32; SFBMAX], sf: &mut [i32; SFBMAX], max_range: &[i32]) {
    let ifqstep = if gi.scalefac_scale { 4 } else { 2 };
    let ifqstep_shift = if gi.scalefac_scale { 2 } else { 1 };
    let sfbmax = gi.sfbmax;

    let preflag = gi.preflag && sfbmax <= PRETAB.len();
    if preflag {
        for sfb in 11..sfbmax {
            sf[sfb] += PRETAB[sfb] * ifqstep;
        }
    }
    for sfb in 0..sfbmax {
        let pre = if preflag { PRETAB[sfb] } else { 0 };
        let gain = gi.global_gain - gi.subblock_gain[gi.window[sfb]] * 8 - pre * ifqstep;
        let value = if sf[sfb] < 0 {
            let m = gain - vbrsfmin[sfb];
            // ifqstep * scalefac >= -sf, so round up
            let mut value = ((ifqstep - 1 - sf[sfb]) >> ifqstep_shift).min(max_range[sfb]);
            if value > 0 && (value << ifqstep_shift) > m {
                value = m >> ifqstep_shift;
            }
            value.max(0)
        } else {
            0
        };
        gi.scalefac[sfb] = Scalefactor::Value(value as u8);
    }
    for slot in gi.scalefac[sfbmax..].iter_mut() {
        *slot = Scalefactor::Value(0);
    }
}

fn sf_depth(sfwork: &[i32; SFBMAX]) -> i32 {
    sfwork.iter().map(|&sf| 255 - sf).max().unwrap_or(0).max(0)
}

fn cut_distribution(sfwork: &mut [i32; SFBMAX], cut: i32) {
    for sf in sfwork.iter_mut() {
        *sf = (*sf).min(cut);
    }
}

/// Move each step `k/dm` of the way toward `p`; returns the largest step
fn flatten_distribution(sfwork: &[i32; SFBMAX], sf_out: &mut [i32; SFBMAX], dm: i32, k: i32, p: i32) -> i32 {
    let mut sfmax = 0;
    for (out, &sf) in sf_out.iter_mut().zip(sfwork) {
        let x = if dm > 0 { (sf + k * (p - sf) / dm).clamp(0, 255) } else { sf };
        *out = x;
        sfmax = sfmax.max(x);
    }
    sfmax
}

/// Shrink scalefactor storage and Huffman division; returns the granule's bits
fn reduce_bit_usage(side: &mut SideInfo, gr: usize, ch: usize, ctx: &SearchContext) -> EncodingResult<i32> {
    best_scalefac_store(side, gr, ch, ctx.version).ok_or_else(|| {
        error!("scalefactors of granule {} channel {} not codable after storage", gr, ch);
        EncodingError::ScalefactorAllocation
    })?;
    let gi = &mut side.tt[gr][ch];
    best_huffman_divide(gi, ctx.bands, ctx.mode_gr());
    Ok(gi.total_bits() as i32)
}

/// Code a granule as silence; the guaranteed fallback when nothing else fits
fn zero_granule(gi: &mut GranuleInfo, ctx: &SearchContext) {
    gi.l3_enc = [0; GRANULE_SIZE];
    gi.scalefac = [Scalefactor::Value(0); SFBMAX];
    gi.scalefac_scale = false;
    gi.preflag = false;
    gi.subblock_gain = [0; 3];
    gi.part2_length = 0;
    gi.scalefac_compress = 0;
    gi.slen = [0; 4];
    noquant_count_bits(gi, ctx.bands, ctx.split);
}

/// Fourth-root (`granule == false`) or square-root weighted split of `total`
fn weighted_split(total: i32, amounts: &[i32], root: fn(f32) -> f32) -> [i32; 2] {
    let mut f = [0.0f32; 2];
    let mut s = 0.0f32;
    for (weight, &amount) in f.iter_mut().zip(amounts) {
        if amount > 0 {
            *weight = root(amount as f32);
            s += *weight;
        }
    }
    let mut out = [0i32; 2];
    for (slot, &weight) in out.iter_mut().zip(&f).take(amounts.len()) {
        *slot = if s > 0.0 { (total as f32 * weight / s) as i32 } else { 0 };
    }
    out
}

/// Hand bits of one party above `used + slack` over to the other
fn rebalance_pair(limits: &mut [i32; 2], used: &[i32; 2], slack: i32) {
    if limits[0] > used[0] + slack {
        limits[1] += limits[0] - (used[0] + slack);
        limits[0] = used[0] + slack;
    }
    if limits[1] > used[1] + slack {
        limits[0] += limits[1] - (used[1] + slack);
        limits[1] = used[1] + slack;
    }
}

/// Run the step-size search on granules `grs` of a frame
///
/// `max_bits[gr][ch]` is the budget of each granule/channel; a budget of
/// zero codes the granule as silence. On return every searched granule
/// is quantized, its scalefactors and Huffman division are final, and the
/// total bits of `grs` are at most the sum of their budgets.
pub fn vbr_encode_granules(
    ctx: &SearchContext,
    side: &mut SideInfo,
    masking: &[Vec<Masking>],
    grs: Range<usize>,
    max_bits: &[[i32; MAX_CHANNELS]; MAX_GRANULES],
) -> EncodingResult<i32> {
    let nch = ctx.channels;
    let ngr = grs.len();
    let mut searches: Vec<Vec<GranuleSearch>> = vec![Vec::with_capacity(nch); MAX_GRANULES];

    let mut max_nbits_ch = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    let mut max_nbits_gr = [0i32; MAX_GRANULES];
    let mut max_nbits_fr = 0;
    let mut use_nbits_ch = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    let mut use_nbits_gr = [0i32; MAX_GRANULES];

    // InitialSearch: step profile per band, then the first allocation
    for gr in grs.clone() {
        for ch in 0..nch {
            max_nbits_ch[gr][ch] = max_bits[gr][ch];
            max_nbits_gr[gr] += max_bits[gr][ch];
            max_nbits_fr += max_bits[gr][ch];

            let gi = &mut side.tt[gr][ch];
            gi.update_max_nonzero_coeff();
            let mut search = GranuleSearch::new(gi, max_bits[gr][ch]);
            if search.active {
                let vbrmax = search.block_sf(gi, &masking[gr][ch].l3_xmin, ctx.effort);
                let sfwork = search.sfwork;
                search.alloc(gi, &sfwork, vbrmax, ctx.mode_gr());
                GranuleSearch::bitcount(gi, ctx.version)?;
            }
            searches[gr].push(search);
        }
    }

    // ConstraintCheck on the unconstrained result
    let mut use_nbits_fr = 0;
    for gr in grs.clone() {
        for ch in 0..nch {
            let search = &searches[gr][ch];
            search.quantize_and_count_bits(&mut side.tt[gr][ch], ctx);
            use_nbits_ch[gr][ch] = reduce_bit_usage(side, gr, ch, ctx)?;
            use_nbits_gr[gr] += use_nbits_ch[gr][ch];
        }
        use_nbits_fr += use_nbits_gr[gr];
    }
    let within_limits = use_nbits_fr <= max_nbits_fr
        && grs.clone().all(|gr| {
            use_nbits_gr[gr] <= MAX_BITS_PER_GRANULE as i32
                && use_nbits_ch[gr][..nch].iter().all(|&bits| bits <= MAX_BITS_PER_CHANNEL as i32)
        });
    if within_limits {
        debug!("step-size search accepted at {} of {} bits", use_nbits_fr, max_nbits_fr);
        return Ok(use_nbits_fr);
    }

    // OutOfBitsRecovery: renegotiate the budget between granules and channels
    debug!("step-size search needs {} bits, {} available; renegotiating", use_nbits_fr, max_nbits_fr);
    let mut sum_fr = 0;
    for gr in grs.clone() {
        max_nbits_gr[gr] = 0;
        for ch in 0..nch {
            max_nbits_ch[gr][ch] = use_nbits_ch[gr][ch].min(MAX_BITS_PER_CHANNEL as i32);
            max_nbits_gr[gr] += max_nbits_ch[gr][ch];
        }
        if max_nbits_gr[gr] > MAX_BITS_PER_GRANULE as i32 {
            let split = weighted_split(MAX_BITS_PER_GRANULE as i32, &max_nbits_ch[gr][..nch], |x| x.sqrt().sqrt());
            max_nbits_ch[gr][..nch].copy_from_slice(&split[..nch]);
            if nch > 1 {
                rebalance_pair(&mut max_nbits_ch[gr], &use_nbits_ch[gr], 32);
                for limit in max_nbits_ch[gr].iter_mut() {
                    *limit = (*limit).min(MAX_BITS_PER_CHANNEL as i32);
                }
            }
            max_nbits_gr[gr] = max_nbits_ch[gr][..nch].iter().sum();
        }
        sum_fr += max_nbits_gr[gr];
    }

    if sum_fr > max_nbits_fr {
        let gr_split = weighted_split(max_nbits_fr, &max_nbits_gr[grs.clone()], f32::sqrt);
        for (k, gr) in grs.clone().enumerate() {
            max_nbits_gr[gr] = gr_split[k];
        }
        if ngr > 1 {
            rebalance_pair(&mut max_nbits_gr, &use_nbits_gr, 125);
            for limit in max_nbits_gr.iter_mut() {
                *limit = (*limit).min(MAX_BITS_PER_GRANULE as i32);
            }
        }
        for gr in grs.clone() {
            let split = weighted_split(max_nbits_gr[gr], &max_nbits_ch[gr][..nch], f32::sqrt);
            max_nbits_ch[gr][..nch].copy_from_slice(&split[..nch]);
            if nch > 1 {
                rebalance_pair(&mut max_nbits_ch[gr], &use_nbits_ch[gr], 32);
                for limit in max_nbits_ch[gr].iter_mut() {
                    *limit = (*limit).min(MAX_BITS_PER_CHANNEL as i32);
                }
            }
        }
    }

    let mut sane = true;
    let mut sum_fr = 0;
    for gr in grs.clone() {
        let sum_gr: i32 = max_nbits_ch[gr][..nch].iter().sum();
        sane &= max_nbits_ch[gr][..nch].iter().all(|&bits| bits <= MAX_BITS_PER_CHANNEL as i32);
        sane &= sum_gr <= MAX_BITS_PER_GRANULE as i32;
        sum_fr += sum_gr;
    }
    if !sane || sum_fr > max_nbits_fr {
        warn!("renegotiated budget inconsistent, falling back to the initial budget");
        max_nbits_ch = *max_bits;
    }

    // scfsi and scalefac_compress are recomputed from scratch below
    for ch in 0..nch {
        side.scfsi[ch] = [false; 4];
    }
    for gr in grs.clone() {
        for gi in side.tt[gr][..nch].iter_mut() {
            gi.scalefac_compress = 0;
        }
    }

    let mut use_nbits_fr = 0;
    for gr in grs.clone() {
        for ch in 0..nch {
            let search = &mut searches[gr][ch];
            if search.active {
                let gi = &mut side.tt[gr][ch];
                cut_distribution(&mut search.sfwork, gi.global_gain);
                let sfwork = search.sfwork;
                search.out_of_bits_strategy(gi, ctx, &sfwork, max_nbits_ch[gr][ch])?;
            }
            let mut used = reduce_bit_usage(side, gr, ch, ctx)?;
            if used > max_nbits_ch[gr][ch] {
                warn!(
                    "granule {} channel {} needs {} bits for a budget of {}, coding it as silence",
                    gr, ch, used, max_nbits_ch[gr][ch]
                );
                zero_granule(&mut side.tt[gr][ch], ctx);
                used = reduce_bit_usage(side, gr, ch, ctx)?;
            }
            use_nbits_fr += used;
        }
    }

    if use_nbits_fr > max_nbits_fr {
        error!("step-size search used {} bits, frame limit is {}", use_nbits_fr, max_nbits_fr);
        return Err(EncodingError::FrameBitsExceeded {
            used: use_nbits_fr as u64,
            limit: max_nbits_fr as u64,
        });
    }
    debug!("step-size search settled at {} of {} bits", use_nbits_fr, max_nbits_fr);
    Ok(use_nbits_fr)
}

/// True when no band of the granule carries energy above its masking threshold
pub fn is_analog_silence(gi: &GranuleInfo, masking: &Masking) -> bool {
    let mut start = 0;
    for sfb in 0..gi.psymax {
        let end = start + gi.width[sfb];
        let energy: f32 = gi.xr[start..end].iter().map(|x| x * x).sum();
        if energy > masking.l3_xmin[sfb] {
            return false;
        }
        start = end;
    }
    true
}
