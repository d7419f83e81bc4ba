use criterion::{Criterion, black_box, criterion_group, criterion_main};
use layoutcrf_core::crf::ViterbiDecoder;
use layoutcrf_core::regions::{LineInfo, RegionAssembler};
use layoutcrf_core::tags::{LineTag, TableTag};

fn page_scores(lines: usize, num_tags: usize) -> Vec<Vec<f32>> {
    (0..lines)
        .map(|i| (0..num_tags).map(|t| ((i * 7 + t * 3) % 11) as f32 / 11.0).collect())
        .collect()
}

fn bench_viterbi(c: &mut Criterion) {
    let decoder = ViterbiDecoder::new(LineTag::NUM_TAGS);
    let scores = page_scores(60, LineTag::NUM_TAGS);
    let transitions = vec![vec![0.1f32; LineTag::NUM_TAGS]; LineTag::NUM_TAGS];

    c.bench_function("viterbi_page_60_lines", |b| {
        b.iter(|| decoder.decode(black_box(&scores), black_box(&transitions)).unwrap());
    });

    let constrained = ViterbiDecoder::new(LineTag::NUM_TAGS)
        .with_constraints(LineTag::transition_mask())
        .unwrap();
    c.bench_function("viterbi_page_60_lines_constrained", |b| {
        b.iter(|| constrained.decode(black_box(&scores), black_box(&transitions)).unwrap());
    });
}

fn bench_table_regions(c: &mut Criterion) {
    let assembler = RegionAssembler::new().unwrap();
    let tags: Vec<u32> = (0..60)
        .map(|i| match i % 12 {
            0..=3 => TableTag::Other.index() as u32,
            11 => TableTag::TableEnd.index() as u32,
            _ => TableTag::Table.index() as u32,
        })
        .collect();
    let lines = vec![
        LineInfo {
            text: "营业收入".into(),
            column_count: 3,
            ..Default::default()
        };
        60
    ];

    c.bench_function("table_regions_60_lines", |b| {
        b.iter(|| assembler.table_regions(black_box(&tags), black_box(&lines)).unwrap());
    });
}

criterion_group!(benches, bench_viterbi, bench_table_regions);
criterion_main!(benches);
