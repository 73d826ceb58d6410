//! Scalefactor bit counting and storage optimization
//!
//! `scale_bitcount` picks the cheapest `scalefac_compress` that can carry a
//! granule's scalefactors. `best_scalefac_store` then shrinks what has to be
//! transmitted: bands without nonzero lines get scalefactor 0, even values
//! are halved under `scalefac_scale`, the pre-emphasis table is folded out
//! through `preflag`, and MPEG-1 second granules reuse band groups from the
//! first granule through scfsi.

use log::trace;

use crate::config::MpegVersion;
use crate::tables::{
    LOG2TAB, MAX_RANGE_SFAC_TAB, NR_OF_SFB_BLOCK, PRETAB, SCFSI_BAND, SLEN1_N, SLEN1_TAB, SLEN2_N, SLEN2_TAB,
};
use crate::types::{BlockType, GranuleInfo, Scalefactor, SideInfo, SBPSY_L, SFBMAX};

fn max_magnitude(scalefac: &[Scalefactor]) -> i32 {
    scalefac.iter().map(|sf| sf.magnitude()).max().unwrap_or(0)
}

/// Fold `PRETAB` out of long-block scalefactors when every band allows it
fn try_preflag(gi: &mut GranuleInfo, free: Option<&[bool; SFBMAX]>) -> bool {
    let is_free = |sfb: usize| free.map_or(false, |mask| mask[sfb]);
    let eligible = (11..SBPSY_L).all(|sfb| is_free(sfb) || gi.scalefac[sfb].magnitude() >= PRETAB[sfb]);
    if !eligible {
        return false;
    }
    for sfb in 11..SBPSY_L {
        if let Scalefactor::Value(v) = gi.scalefac[sfb] {
            if v > 0 {
                gi.scalefac[sfb] = Scalefactor::Value(v - PRETAB[sfb] as u8);
            }
        }
    }
    gi.preflag = true;
    true
}

fn mpeg1_scale_bitcount(gi: &mut GranuleInfo) -> Option<u32> {
    if gi.block_type != BlockType::Short && !gi.preflag {
        try_preflag(gi, None);
    }
    let max_slen1 = max_magnitude(&gi.scalefac[..gi.sfbdivide]);
    let max_slen2 = max_magnitude(&gi.scalefac[gi.sfbdivide..gi.sfbmax]);
    let n1 = gi.sfbdivide as u32;
    let n2 = (gi.sfbmax - gi.sfbdivide) as u32;

    let best = (0..16)
        .filter(|&k| max_slen1 < SLEN1_N[k] && max_slen2 < SLEN2_N[k])
        .map(|k| (n1 * SLEN1_TAB[k] + n2 * SLEN2_TAB[k], k))
        .min()?;
    gi.part2_length = best.0;
    gi.scalefac_compress = best.1 as u32;
    Some(best.0)
}

fn mpeg2_scale_bitcount(gi: &mut GranuleInfo) -> Option<u32> {
    let table = if gi.preflag { 2 } else { 0 };
    let row = if gi.block_type == BlockType::Short { 1 } else { 0 };
    let partitions = NR_OF_SFB_BLOCK[table][row];

    let mut max_sfac = [0i32; 4];
    let mut slot = 0;
    for (partition, &count) in partitions.iter().enumerate() {
        max_sfac[partition] = max_magnitude(&gi.scalefac[slot..slot + count]);
        slot += count;
    }
    if max_sfac
        .iter()
        .zip(&MAX_RANGE_SFAC_TAB[table])
        .any(|(&max, &range)| max > range)
    {
        return None;
    }

    gi.sfb_partition = partitions;
    for (slen, &max) in gi.slen.iter_mut().zip(&max_sfac) {
        *slen = LOG2TAB[max as usize];
    }
    let [s1, s2, s3, s4] = gi.slen;
    gi.scalefac_compress = match table {
        0 => (((s1 * 5) + s2) << 4) + (s3 << 2) + s4,
        _ => 500 + s1 * 3 + s2,
    };
    gi.part2_length = gi
        .slen
        .iter()
        .zip(&partitions)
        .map(|(&slen, &count)| slen * count as u32)
        .sum();
    Some(gi.part2_length)
}

/// Choose `scalefac_compress` (and MPEG-2 `slen`) for the granule
///
/// MPEG-1 long blocks get `preflag` set when the pre-emphasis table fits
/// under every upper band. Returns the scalefactor bits, or `None` when no
/// compression setting can hold the values.
pub fn scale_bitcount(gi: &mut GranuleInfo, version: MpegVersion) -> Option<u32> {
    match version {
        MpegVersion::Mpeg1 => mpeg1_scale_bitcount(gi),
        MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => mpeg2_scale_bitcount(gi),
    }
}

/// Mark band groups of granule 1 that can reuse granule 0 and recount
fn scfsi_calc(g0: &GranuleInfo, gi: &mut GranuleInfo, free: &[bool; SFBMAX], scfsi: &mut [bool; 4]) -> Option<u32> {
    for (group, bounds) in SCFSI_BAND.windows(2).enumerate() {
        let bands = bounds[0]..bounds[1];
        if bands.clone().all(|sfb| free[sfb] || g0.scalefac[sfb] == gi.scalefac[sfb]) {
            for sfb in bands {
                gi.scalefac[sfb] = Scalefactor::Reused;
            }
            scfsi[group] = true;
        }
    }

    let stats = |range: std::ops::Range<usize>| {
        gi.scalefac[range]
            .iter()
            .filter_map(|sf| sf.value())
            .fold((0i32, 0u32), |(max, count), v| (max.max(i32::from(v)), count + 1))
    };
    let (s1, c1) = stats(0..11);
    let (s2, c2) = stats(11..SBPSY_L);

    let best = (0..16)
        .filter(|&k| s1 < SLEN1_N[k] && s2 < SLEN2_N[k])
        .map(|k| (SLEN1_TAB[k] * c1 + SLEN2_TAB[k] * c2, k))
        .min()?;
    gi.part2_length = best.0;
    gi.scalefac_compress = best.1 as u32;
    trace!("scfsi {:?} leaves {} scalefactor bits", scfsi, best.0);
    Some(best.0)
}

/// Minimize the scalefactor bits of `side.tt[gr][ch]`
///
/// May change scalefactor values, `scalefac_scale`, `preflag`,
/// `scalefac_compress`, `part2_length` and, for MPEG-1 granule 1,
/// `side.scfsi[ch]`. The quantized spectrum is untouched. Returns `None`
/// when the resulting scalefactors cannot be coded.
pub fn best_scalefac_store(side: &mut SideInfo, gr: usize, ch: usize, version: MpegVersion) -> Option<u32> {
    let mode_gr = version.granules();
    let gi = &mut side.tt[gr][ch];

    // Bands without a nonzero line may carry any scalefactor
    let mut free = [false; SFBMAX];
    let mut recalc = false;
    let mut start = 0;
    for sfb in 0..gi.sfbmax {
        let end = start + gi.width[sfb];
        if gi.l3_enc[start..end].iter().all(|&v| v == 0) {
            free[sfb] = true;
            gi.scalefac[sfb] = Scalefactor::Value(0);
            recalc = true;
        }
        start = end;
    }

    if !gi.scalefac_scale && !gi.preflag {
        let s = gi.scalefac[..gi.sfbmax].iter().fold(0i32, |s, sf| s | sf.magnitude());
        if s & 1 == 0 && s != 0 {
            for sf in gi.scalefac[..gi.sfbmax].iter_mut() {
                if let Scalefactor::Value(v) = *sf {
                    *sf = Scalefactor::Value(v >> 1);
                }
            }
            gi.scalefac_scale = true;
            recalc = true;
        }
    }

    if !gi.preflag && gi.block_type != BlockType::Short && mode_gr == 2 && try_preflag(gi, Some(&free)) {
        recalc = true;
    }

    side.scfsi[ch] = [false; 4];
    if mode_gr == 2
        && gr == 1
        && side.tt[0][ch].block_type != BlockType::Short
        && side.tt[1][ch].block_type != BlockType::Short
    {
        let (first, second) = side.tt.split_at_mut(1);
        return scfsi_calc(&first[0][ch], &mut second[0][ch], &free, &mut side.scfsi[ch]);
    }

    let gi = &mut side.tt[gr][ch];
    if recalc {
        scale_bitcount(gi, version)
    } else {
        Some(gi.part2_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::SCALEFACTOR_BANDS;
    use proptest::prelude::*;

    fn long_granule() -> GranuleInfo {
        let mut gi = GranuleInfo::new(BlockType::Normal, &SCALEFACTOR_BANDS[0]);
        gi.l3_enc.fill(1);
        gi
    }

    fn set_values(gi: &mut GranuleInfo, values: &[u8]) {
        for (sf, &v) in gi.scalefac.iter_mut().zip(values) {
            *sf = Scalefactor::Value(v);
        }
    }

    #[test]
    fn test_mpeg1_picks_cheapest_compress() {
        let mut gi = long_granule();
        set_values(&mut gi, &[3, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0]);
        assert_eq!(scale_bitcount(&mut gi, MpegVersion::Mpeg1), Some(11 * 2 + 10));
        assert_eq!(gi.scalefac_compress, 8);
        assert!(!gi.preflag);
    }

    #[test]
    fn test_mpeg1_auto_preflag() {
        let mut gi = long_granule();
        let mut values = [0u8; 21];
        for sfb in 11..21 {
            values[sfb] = PRETAB[sfb] as u8 + 1;
        }
        set_values(&mut gi, &values);
        scale_bitcount(&mut gi, MpegVersion::Mpeg1).unwrap();
        assert!(gi.preflag);
        assert!(gi.scalefac[11..21].iter().all(|&sf| sf == Scalefactor::Value(1)));
    }

    #[test]
    fn test_mpeg1_uncodable() {
        let mut gi = long_granule();
        gi.scalefac[0] = Scalefactor::Value(16);
        assert_eq!(scale_bitcount(&mut gi, MpegVersion::Mpeg1), None);
    }

    #[test]
    fn test_mpeg2_partitions() {
        let mut gi = GranuleInfo::new(BlockType::Normal, &SCALEFACTOR_BANDS[3]);
        gi.scalefac[0] = Scalefactor::Value(9);
        gi.scalefac[7] = Scalefactor::Value(2);
        assert_eq!(scale_bitcount(&mut gi, MpegVersion::Mpeg2), Some(6 * 4 + 5 * 2));
        assert_eq!(gi.slen, [4, 2, 0, 0]);
        assert_eq!(gi.scalefac_compress, ((4 * 5 + 2) << 4));
        assert_eq!(gi.sfb_partition, [6, 5, 5, 5]);
    }

    #[test]
    fn test_mpeg2_range_exceeded() {
        let mut gi = GranuleInfo::new(BlockType::Normal, &SCALEFACTOR_BANDS[3]);
        gi.scalefac[17] = Scalefactor::Value(8);
        assert_eq!(scale_bitcount(&mut gi, MpegVersion::Mpeg2), None);
    }

    #[test]
    fn test_store_halves_even_scalefactors() {
        let mut side = SideInfo::default();
        let mut gi = long_granule();
        set_values(&mut gi, &[4, 2, 6, 0, 2]);
        side.tt[0][0] = gi;
        best_scalefac_store(&mut side, 0, 0, MpegVersion::Mpeg1).unwrap();
        let gi = &side.tt[0][0];
        assert!(gi.scalefac_scale);
        assert_eq!(&gi.scalefac[..5], &[2, 1, 3, 0, 1].map(Scalefactor::Value));
    }

    #[test]
    fn test_store_frees_silent_bands() {
        let mut side = SideInfo::default();
        let mut gi = long_granule();
        set_values(&mut gi, &[5; 21]);
        gi.l3_enc[..gi.width[0]].fill(0);
        side.tt[0][0] = gi;
        best_scalefac_store(&mut side, 0, 0, MpegVersion::Mpeg1).unwrap();
        assert_eq!(side.tt[0][0].scalefac[0], Scalefactor::Value(0));
    }

    #[test]
    fn test_scfsi_reuses_matching_groups() {
        let mut side = SideInfo::default();
        let mut values = [1u8; 21];
        values[0] = 3;
        for gr in 0..2 {
            let mut gi = long_granule();
            set_values(&mut gi, &values);
            side.tt[gr][0] = gi;
        }
        // granule 1 differs only in the third band group
        side.tt[1][0].scalefac[12] = Scalefactor::Value(2);

        for gr in 0..2 {
            scale_bitcount(&mut side.tt[gr][0], MpegVersion::Mpeg1).unwrap();
        }
        let bits0 = best_scalefac_store(&mut side, 0, 0, MpegVersion::Mpeg1).unwrap();
        let bits1 = best_scalefac_store(&mut side, 1, 0, MpegVersion::Mpeg1).unwrap();
        assert_eq!(side.scfsi[0], [true, true, false, true]);
        let gi = &side.tt[1][0];
        assert!(gi.scalefac[..11].iter().all(|&sf| sf == Scalefactor::Reused));
        assert_eq!(gi.scalefac[12], Scalefactor::Value(2));
        assert!(bits1 < bits0);
        assert_eq!(bits1, SLEN2_TAB[gi.scalefac_compress as usize] * 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn property_store_never_adds_bits(
            g0 in prop::collection::vec(0u8..8, 21),
            g1 in prop::collection::vec(0u8..8, 21),
            silent in prop::collection::vec(any::<bool>(), 21),
        ) {
            let mut side = SideInfo::default();
            for (gr, values) in [&g0, &g1].into_iter().enumerate() {
                let mut gi = long_granule();
                set_values(&mut gi, values);
                let mut start = 0;
                for sfb in 0..21 {
                    let end = start + gi.width[sfb];
                    if silent[sfb] && gr == 1 {
                        gi.l3_enc[start..end].fill(0);
                    }
                    start = end;
                }
                side.tt[gr][0] = gi;
            }
            for gr in 0..2 {
                let before = scale_bitcount(&mut side.tt[gr][0], MpegVersion::Mpeg1).unwrap();
                let after = best_scalefac_store(&mut side, gr, 0, MpegVersion::Mpeg1).unwrap();
                prop_assert!(after <= before);
            }
            // Reused only appears where scfsi says so
            let gi = &side.tt[1][0];
            for (group, bounds) in SCFSI_BAND.windows(2).enumerate() {
                for sfb in bounds[0]..bounds[1] {
                    prop_assert_eq!(gi.scalefac[sfb] == Scalefactor::Reused, side.scfsi[0][group]);
                }
            }
        }
    }
}
