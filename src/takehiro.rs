//! Huffman bit counting and table selection
//!
//! Everything here counts bits without writing them. The step-size search
//! calls into this module for every candidate quantization, so the hot
//! paths use precomputed code lengths that already include sign bits.
//!
//! Table choice for a region depends on the largest magnitude in it:
//! an all-zero region needs no table and a region of ones uses table 1.
//! Magnitudes up to 15 pick the cheapest of two or three small tables; for
//! 8 to 15 one candidate is table 16 with one zero linbit per saturated
//! value, selected as index 14. Anything larger is coded with escape bits
//! on tables 16-31.

use lazy_static::lazy_static;

use crate::huffman::{self, normalize_table_select, COUNT1_TABLE_A, COUNT1_TABLE_B, FIRST_ESC_TABLE};
use crate::tables::{ScalefactorBands, SUBDV_TABLE};
use crate::types::{BlockType, GranuleInfo, GRANULE_SIZE, IXMAX_VAL, SBMAX_L};

/// Bit count reported for a region that cannot be coded at all
pub const LARGE_BITS: u32 = 100_000;

/// First escape table of the second escape family
const ESC_TABLE_B: usize = 24;

/// Table 16 used without escape excess; written as 16
const NOESC_T16: usize = 14;

/// Smallest table of each candidate group, indexed by the region maximum minus one
const HUF_TBL_NOESC: [usize; 15] = [1, 2, 5, 7, 7, 10, 10, 13, 13, 13, 13, 13, 13, 13, 13];

lazy_static! {
    /// Pair code lengths plus sign bits, indexed like the table's codes.
    /// Escape tables hold the length of the capped pair; linbits are added
    /// separately. Slot 14 is table 16 restricted to magnitudes up to 15,
    /// with its single linbit already counted.
    static ref PAIR_BITS: Vec<Vec<u32>> = (0..COUNT1_TABLE_A)
        .map(|index| {
            let table = huffman::table(normalize_table_select(index));
            let linbit = |v: usize| (index == NOESC_T16 && v == 15) as u32;
            (0..table.codes.len())
                .map(|i| {
                    let (x, y) = (i / table.xlen, i % table.xlen);
                    table.lens[i] as u32 + (x != 0) as u32 + (y != 0) as u32 + linbit(x) + linbit(y)
                })
                .collect()
        })
        .collect();

    /// Quadruple code lengths plus sign bits for tables 32 and 33
    static ref QUAD_BITS: [[u32; 16]; 2] = {
        let mut bits = [[0u32; 16]; 2];
        for (row, index) in [COUNT1_TABLE_A, COUNT1_TABLE_B].into_iter().enumerate() {
            let table = huffman::table(index);
            for (pattern, slot) in bits[row].iter_mut().enumerate() {
                *slot = table.quad(pattern).1 + (pattern as u32).count_ones();
            }
        }
        bits
    };
}

/// Count1 pattern `8v + 4w + 2x + y` for a quadruple of magnitudes 0 or 1
#[inline]
pub fn quad_pattern(quad: &[i32]) -> usize {
    ((quad[0] * 2 + quad[1]) * 2 + quad[2]) as usize * 2 + quad[3] as usize
}

/// Bits of one count1 pattern with table 32 (`select == 0`) or 33
#[inline]
pub fn quad_bits(pattern: usize, select: usize) -> u32 {
    QUAD_BITS[select][pattern]
}

fn ix_max(ix: &[i32]) -> i32 {
    ix.iter().copied().max().unwrap_or(0)
}

fn count_bit_noesc(ix: &[i32], table: usize) -> u32 {
    let xlen = huffman::table(normalize_table_select(table)).xlen;
    let bits = &PAIR_BITS[table];
    ix.chunks_exact(2)
        .map(|pair| bits[pair[0] as usize * xlen + pair[1] as usize])
        .sum()
}

/// Cheapest of `candidates`; the lowest index wins ties
fn count_bit_noesc_from(ix: &[i32], candidates: &[usize]) -> (usize, u32) {
    let mut best = (candidates[0], count_bit_noesc(ix, candidates[0]));
    for &table in &candidates[1..] {
        let bits = count_bit_noesc(ix, table);
        if bits < best.1 {
            best = (table, bits);
        }
    }
    best
}

fn count_bit_esc(ix: &[i32], t1: usize, t2: usize) -> (usize, u32) {
    let lin1 = huffman::table(t1).linbits;
    let lin2 = huffman::table(t2).linbits;
    let (mut sum1, mut sum2) = (0u32, 0u32);

    for pair in ix.chunks_exact(2) {
        let mut escaped = 0;
        let x = if pair[0] >= 15 {
            escaped += 1;
            15
        } else {
            pair[0] as usize
        };
        let y = if pair[1] >= 15 {
            escaped += 1;
            15
        } else {
            pair[1] as usize
        };
        let index = x * 16 + y;
        sum1 += PAIR_BITS[FIRST_ESC_TABLE][index] + escaped * lin1;
        sum2 += PAIR_BITS[ESC_TABLE_B][index] + escaped * lin2;
    }

    if sum1 > sum2 {
        (t2, sum2)
    } else {
        (t1, sum1)
    }
}

/// Choose the cheapest table for a region of magnitudes
///
/// Returns the table index and the bits needed, signs and escape bits
/// included. A region holding a magnitude above `IXMAX_VAL` costs
/// `LARGE_BITS`.
pub fn choose_table(ix: &[i32]) -> (usize, u32) {
    let max = ix_max(ix);
    match max {
        0 => (0, 0),
        1 => (1, count_bit_noesc(ix, 1)),
        2 | 3 => {
            let t1 = HUF_TBL_NOESC[max as usize - 1];
            count_bit_noesc_from(ix, &[t1, t1 + 1])
        }
        4..=7 => {
            let t1 = HUF_TBL_NOESC[max as usize - 1];
            count_bit_noesc_from(ix, &[t1, t1 + 1, t1 + 2])
        }
        8..=15 => count_bit_noesc_from(ix, &[13, NOESC_T16, 15]),
        _ if max > IXMAX_VAL => (31, LARGE_BITS),
        _ => {
            let excess = (max - 15) as u32;
            let choice2 = (ESC_TABLE_B..COUNT1_TABLE_A)
                .find(|&t| huffman::table(t).linmax >= excess)
                .unwrap_or(COUNT1_TABLE_A - 1);
            let choice = (choice2 - 8..ESC_TABLE_B)
                .find(|&t| huffman::table(t).linmax >= excess)
                .unwrap_or(ESC_TABLE_B - 1);
            count_bit_esc(ix, choice, choice2)
        }
    }
}

/// Region split points preferred for each big_values length
///
/// Built once per sample rate. Entry `i - 2` holds the region0 count and
/// entry `i - 1` the region1 count for a big-values region ending at `i`.
#[derive(Debug, Clone)]
pub struct BigValuesSplit {
    bv_scf: [usize; GRANULE_SIZE],
}

impl BigValuesSplit {
    pub fn new(bands: &ScalefactorBands) -> Self {
        let l = |index: isize| bands.l[index as usize];
        let mut bv_scf = [0usize; GRANULE_SIZE];

        for i in (2..=GRANULE_SIZE).step_by(2) {
            let mut scfb_anz = 0;
            loop {
                scfb_anz += 1;
                if bands.l[scfb_anz] >= i {
                    break;
                }
            }
            let (region0, region1) = SUBDV_TABLE[scfb_anz];

            let mut bv_index = region0 as isize;
            while l(bv_index + 1) > i {
                bv_index -= 1;
            }
            if bv_index < 0 {
                bv_index = region0 as isize;
            }
            bv_scf[i - 2] = bv_index as usize;

            let r0 = bv_scf[i - 2] as isize;
            let mut bv_index = region1 as isize;
            while l(bv_index + r0 + 2) > i {
                bv_index -= 1;
            }
            if bv_index < 0 {
                bv_index = region1 as isize;
            }
            bv_scf[i - 1] = bv_index as usize;
        }

        Self { bv_scf }
    }

    /// (region0_count, region1_count) for a big-values region ending at `end`
    #[inline]
    pub fn regions(&self, end: usize) -> (usize, usize) {
        (self.bv_scf[end - 2], self.bv_scf[end - 1])
    }
}

/// Start of the second big-values region for window-switched blocks
pub fn switched_region1_start(gi: &GranuleInfo, bands: &ScalefactorBands) -> usize {
    if gi.block_type == BlockType::Short {
        3 * bands.s[3]
    } else {
        bands.l[7 + 1]
    }
}

/// Count the Huffman bits of a quantized granule
///
/// Sets the count1 and big-values boundaries, the count1 table, the region
/// split (normal blocks) and the three table selections. Stores and returns
/// the Huffman bit count in `part2_3_length`.
pub fn noquant_count_bits(gi: &mut GranuleInfo, bands: &ScalefactorBands, split: &BigValuesSplit) -> u32 {
    let ix = gi.l3_enc;
    gi.table_select = [0; 3];

    let mut i = GRANULE_SIZE;
    while i > 1 && ix[i - 1] == 0 && ix[i - 2] == 0 {
        i -= 2;
    }
    gi.count1 = i;

    let (mut a1, mut a2) = (0u32, 0u32);
    while i > 3 {
        let quad = &ix[i - 4..i];
        if quad.iter().any(|&v| v > 1) {
            break;
        }
        let pattern = quad_pattern(quad);
        a1 += quad_bits(pattern, 0);
        a2 += quad_bits(pattern, 1);
        i -= 4;
    }
    let mut bits = a1;
    gi.count1table_select = 0;
    if a1 > a2 {
        bits = a2;
        gi.count1table_select = 1;
    }
    gi.count1bits = bits;
    gi.big_values = i;

    if i == 0 {
        gi.part2_3_length = bits;
        return bits;
    }

    let (r1_start, r2_start) = match gi.block_type {
        BlockType::Short => (switched_region1_start(gi, bands).min(i), i),
        BlockType::Normal => {
            let (region0, region1) = split.regions(i);
            gi.region0_count = region0;
            gi.region1_count = region1;
            let a2 = bands.l[region0 + region1 + 2];
            let a1 = bands.l[region0 + 1];
            if a2 < i {
                let (table, count) = choose_table(&ix[a2..i]);
                gi.table_select[2] = table;
                bits += count;
            }
            (a1.min(i), a2.min(i))
        }
        BlockType::Start | BlockType::Stop => {
            gi.region0_count = 7;
            gi.region1_count = SBMAX_L - 1 - 7 - 1;
            (switched_region1_start(gi, bands).min(i), i)
        }
    };

    if r1_start > 0 {
        let (table, count) = choose_table(&ix[..r1_start]);
        gi.table_select[0] = table;
        bits += count;
    }
    if r1_start < r2_start {
        let (table, count) = choose_table(&ix[r1_start..r2_start]);
        gi.table_select[1] = table;
        bits += count;
    }

    gi.part2_3_length = bits;
    bits
}

/// The fields a region or count1 rearrangement changes
#[derive(Debug, Clone, Copy)]
struct Division {
    big_values: usize,
    count1: usize,
    count1bits: u32,
    count1table_select: usize,
    region0_count: usize,
    region1_count: usize,
    table_select: [usize; 3],
    part2_3_length: u32,
}

impl Division {
    fn of(gi: &GranuleInfo) -> Self {
        Self {
            big_values: gi.big_values,
            count1: gi.count1,
            count1bits: gi.count1bits,
            count1table_select: gi.count1table_select,
            region0_count: gi.region0_count,
            region1_count: gi.region1_count,
            table_select: gi.table_select,
            part2_3_length: gi.part2_3_length,
        }
    }

    fn apply(&self, gi: &mut GranuleInfo) {
        gi.big_values = self.big_values;
        gi.count1 = self.count1;
        gi.count1bits = self.count1bits;
        gi.count1table_select = self.count1table_select;
        gi.region0_count = self.region0_count;
        gi.region1_count = self.region1_count;
        gi.table_select = self.table_select;
        gi.part2_3_length = self.part2_3_length;
    }
}

/// Cheapest region0+region1 coding for every combined region count
struct RegionCosts {
    bits: [u32; 7 + 15 + 1],
    div: [usize; 7 + 15 + 1],
    r0_table: [usize; 7 + 15 + 1],
    r1_table: [usize; 7 + 15 + 1],
}

impl RegionCosts {
    fn new(ix: &[i32], big_values: usize, bands: &ScalefactorBands) -> Self {
        let mut costs = Self {
            bits: [LARGE_BITS; 7 + 15 + 1],
            div: [0; 7 + 15 + 1],
            r0_table: [0; 7 + 15 + 1],
            r1_table: [0; 7 + 15 + 1],
        };

        for r0 in 0..16 {
            let a1 = bands.l[r0 + 1];
            if a1 >= big_values {
                break;
            }
            let (r0_table, r0_bits) = choose_table(&ix[..a1]);
            for r1 in 0..8 {
                let a2 = bands.l[r0 + r1 + 2];
                if a2 >= big_values {
                    break;
                }
                let (r1_table, r1_bits) = choose_table(&ix[a1..a2]);
                let bits = r0_bits + r1_bits;
                let slot = r0 + r1;
                if costs.bits[slot] > bits {
                    costs.bits[slot] = bits;
                    costs.div[slot] = r0;
                    costs.r0_table[slot] = r0_table;
                    costs.r1_table[slot] = r1_table;
                }
            }
        }
        costs
    }

    /// Try every region2 start against `candidate`, keeping whatever beats `best`
    fn apply_best(&self, ix: &[i32], candidate: &Division, best: &mut Division, bands: &ScalefactorBands) {
        let big_values = candidate.big_values;
        for r2 in 2..SBMAX_L + 1 {
            let a2 = bands.l[r2];
            if a2 >= big_values {
                break;
            }
            let mut bits = self.bits[r2 - 2] + candidate.count1bits;
            if best.part2_3_length <= bits {
                break;
            }
            let (r2_table, r2_bits) = choose_table(&ix[a2..big_values]);
            bits += r2_bits;
            if best.part2_3_length <= bits {
                continue;
            }
            *best = Division {
                part2_3_length: bits,
                region0_count: self.div[r2 - 2],
                region1_count: r2 - 2 - self.div[r2 - 2],
                table_select: [self.r0_table[r2 - 2], self.r1_table[r2 - 2], r2_table],
                ..*candidate
            };
        }
    }
}

/// Search for a cheaper region split and count1 boundary
///
/// Requires `noquant_count_bits` to have run on `gi`. May change the region
/// counts, the table selection, the big-values/count1 boundary and
/// `part2_3_length`; never increases the bit count.
pub fn best_huffman_divide(gi: &mut GranuleInfo, bands: &ScalefactorBands, mode_gr: usize) {
    if gi.block_type == BlockType::Short && mode_gr == 1 {
        return;
    }
    let ix = gi.l3_enc;
    let mut best = Division::of(gi);

    let costs = if gi.block_type == BlockType::Normal {
        let costs = RegionCosts::new(&ix, gi.big_values, bands);
        let candidate = best;
        costs.apply_best(&ix, &candidate, &mut best, bands);
        Some(costs)
    } else {
        None
    };

    let big_values = gi.big_values;
    if big_values == 0 || ix[big_values - 2] > 1 || ix[big_values - 1] > 1 {
        best.apply(gi);
        return;
    }
    let mut i = gi.count1 + 2;
    if i > GRANULE_SIZE {
        best.apply(gi);
        return;
    }

    // Move the last big-values pair into the count1 region
    let mut candidate = Division {
        count1: i,
        ..best
    };
    let (mut a1, mut a2) = (0u32, 0u32);
    while i > big_values {
        let pattern = quad_pattern(&ix[i - 4..i]);
        a1 += quad_bits(pattern, 0);
        a2 += quad_bits(pattern, 1);
        i -= 4;
    }
    candidate.big_values = i;
    candidate.count1table_select = 0;
    if a1 > a2 {
        a1 = a2;
        candidate.count1table_select = 1;
    }
    candidate.count1bits = a1;

    match costs {
        Some(costs) => costs.apply_best(&ix, &candidate, &mut best, bands),
        None => {
            candidate.part2_3_length = a1;
            candidate.table_select = [0; 3];
            let a1 = switched_region1_start(gi, bands).min(i);
            if a1 > 0 {
                let (table, bits) = choose_table(&ix[..a1]);
                candidate.table_select[0] = table;
                candidate.part2_3_length += bits;
            }
            if i > a1 {
                let (table, bits) = choose_table(&ix[a1..i]);
                candidate.table_select[1] = table;
                candidate.part2_3_length += bits;
            }
            if best.part2_3_length > candidate.part2_3_length {
                best = candidate;
            }
        }
    }
    best.apply(gi);
}
