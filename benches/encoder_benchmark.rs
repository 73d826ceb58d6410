//! Benchmarks for the bitstream back end
//!
//! Covers Huffman table selection, the VBR step-size search on a single
//! granule, and whole-frame encoding through `EncoderState`.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use l3_bitstream::config::SearchEffort;
use l3_bitstream::tables::{scalefactor_bands, ScalefactorBands};
use l3_bitstream::takehiro::{choose_table, BigValuesSplit};
use l3_bitstream::vbr::{vbr_encode_granules, SearchContext};
use l3_bitstream::{BlockType, Config, EncoderState, FrameInput, GranuleInfo, Masking, MpegVersion, SideInfo};

fn noisy_granule(bands: &ScalefactorBands, amplitude: f32, seed: u32) -> GranuleInfo {
    let mut gi = GranuleInfo::new(BlockType::Normal, bands);
    let mut state = seed;
    for (i, x) in gi.xr.iter_mut().enumerate() {
        state = state.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
        let noise = ((state >> 16) % 2001) as f32 / 1000.0 - 1.0;
        *x = amplitude * noise / (1.0 + i as f32 / 20.0);
    }
    gi
}

fn masking_for(gi: &GranuleInfo) -> Masking {
    let mut masking = Masking::default();
    let mut start = 0;
    for sfb in 0..gi.slots() {
        let end = start + gi.width[sfb];
        masking.l3_xmin[sfb] = gi.xr[start..end].iter().map(|x| x * x).sum::<f32>() * 2e-3;
        start = end;
    }
    masking.pe = 900.0;
    masking
}

fn analysed_frame(state: &EncoderState, seed: u32) -> FrameInput {
    let config = state.config();
    let granules: Vec<Vec<GranuleInfo>> = (0..config.mode_gr())
        .map(|gr| {
            (0..config.channels())
                .map(|ch| noisy_granule(state.bands(), 2000.0, seed + (gr * 2 + ch) as u32))
                .collect()
        })
        .collect();
    let masking = granules
        .iter()
        .map(|row| row.iter().map(masking_for).collect())
        .collect();
    FrameInput {
        granules,
        masking: Some(masking),
        ms_stereo: false,
    }
}

fn benchmark_choose_table(c: &mut Criterion) {
    let mut state = 12_345u32;
    let ix: Vec<i32> = (0..288)
        .map(|_| {
            state = state.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
            ((state >> 16) % 24) as i32
        })
        .collect();

    c.bench_function("choose_table", |b| {
        b.iter(|| black_box(choose_table(black_box(&ix))))
    });
}

fn benchmark_vbr_search(c: &mut Criterion) {
    let Some(bands) = scalefactor_bands(44_100) else {
        return;
    };
    let split = BigValuesSplit::new(bands);
    let granule = noisy_granule(bands, 2000.0, 7);
    let masking = vec![vec![masking_for(&granule)]];
    let mut max_bits = [[0i32; 2]; 2];
    max_bits[0][0] = 2500;

    let mut group = c.benchmark_group("vbr_search");
    for (name, effort) in [("full", SearchEffort::Full), ("fast", SearchEffort::Fast)] {
        let ctx = SearchContext {
            bands,
            split: &split,
            version: MpegVersion::Mpeg1,
            effort,
            channels: 1,
        };
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut side = SideInfo::default();
                side.tt[0][0] = granule.clone();
                black_box(vbr_encode_granules(&ctx, &mut side, &masking, 0..1, &max_bits).unwrap());
            })
        });
    }
    group.finish();
}

fn benchmark_frame_encoding(c: &mut Criterion) {
    c.bench_function("encode_silent_frame", |b| {
        let mut state = EncoderState::new(Config::default()).unwrap();
        let mut out = Vec::with_capacity(1 << 20);
        b.iter(|| {
            let input = FrameInput::silence(state.config(), state.bands());
            state.encode_frame(input, &mut out).unwrap();
            out.clear();
        })
    });

    c.bench_function("encode_analysed_frame", |b| {
        let mut state = EncoderState::new(Config::default()).unwrap();
        let mut out = Vec::with_capacity(1 << 20);
        let mut seed = 0;
        b.iter(|| {
            seed += 4;
            let input = analysed_frame(&state, seed);
            black_box(state.encode_frame(input, &mut out).unwrap());
            out.clear();
        })
    });
}

criterion_group!(
    benches,
    benchmark_choose_table,
    benchmark_vbr_search,
    benchmark_frame_encoding
);
criterion_main!(benches);
