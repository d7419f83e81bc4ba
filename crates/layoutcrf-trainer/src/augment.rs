//! # Training data augmentation
//!
//! Cell-pair generation for the cell merge classifier, and brightness
//! jitter for glyph images.
//!
//! Cell texts come one table per block: a line starting with `#` closes a
//! table, and cells within a line are separated by `<a>`. Every table
//! yields positive pairs (a cell cut in two, label 1) and negative pairs
//! (two different cells glued together, label 0).

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use layoutcrf_core::data::{CellRecord, FontRecord};
use layoutcrf_core::vocab::{CELL_SEPARATOR, PAD_TOKEN, UNK_TOKEN, Vocab};
use oorandom::Rand32;
use serde::Serialize;
use tracing::info;

use crate::pipeline::{BatchSource, rand_below, shuffle};

/// Width of the sliding window over a cell, in characters.
pub const WINDOW: usize = 9;
/// Token count every written record is padded to.
pub const RECORD_TOKENS: usize = 10;
/// Marker between the halves of a pair in `vocab.txt`.
pub const SPLIT_TOKEN: &str = "<b>";
/// Shortest half of a pair.
const MIN_HALF: usize = 2;
const WINDOW_FILL: char = '&';
/// One table in this many goes to the evaluation split.
const EVAL_ONE_IN: u32 = 20;
/// Largest brightness shift, in pixel levels.
pub const MAX_BRIGHTNESS_DELTA: i16 = 32;

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// Two adjacent texts and whether they belong to one cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellPair {
    pub left: String,
    pub right: String,
    pub label: i64,
}

impl CellPair {
    /// Record with one token per character, `<PAD>`-filled to
    /// [`RECORD_TOKENS`] on the right.
    pub fn to_record(&self) -> CellRecord {
        let left: Vec<String> = self.left.chars().map(String::from).collect();
        let mut right: Vec<String> = self.right.chars().map(String::from).collect();
        let used = left.len() + right.len() + 1;
        if used < RECORD_TOKENS {
            right.extend(std::iter::repeat_n(PAD_TOKEN.to_string(), RECORD_TOKENS - used));
        }
        CellRecord {
            x_l: left.join(" "),
            x_r: right.join(" "),
            y: self.label,
            l: used as i64,
        }
    }
}

/// Split cell text into tables of distinct CJK cells.
pub fn parse_tables(text: &str) -> Vec<Vec<String>> {
    let mut tables = Vec::new();
    let mut table: Vec<String> = Vec::new();
    for line in text.lines() {
        let line: String = line.trim().chars().filter(|c| !c.is_whitespace()).collect();
        if line.starts_with('#') {
            if !table.is_empty() {
                tables.push(std::mem::take(&mut table));
            }
            continue;
        }
        if line.chars().count() <= 1 {
            continue;
        }
        for cell in line.split(CELL_SEPARATOR) {
            if contains_cjk(cell) && !table.iter().any(|c| c == cell) {
                table.push(cell.to_string());
            }
        }
    }
    if !table.is_empty() {
        tables.push(table);
    }
    tables
}

/// Generates deduplicated pairs across all tables of a dataset.
pub struct PairGenerator {
    seen: HashSet<String>,
    rng: Rand32,
}

impl PairGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            seen: HashSet::new(),
            rng: Rand32::new(seed),
        }
    }

    /// Pairs from one table's cells.
    pub fn table(&mut self, cells: &[String]) -> Vec<CellPair> {
        let mut out = Vec::new();
        for (i, cell) in cells.iter().enumerate() {
            self.positives(cell, &mut out);
            if cells.len() <= 1 {
                continue;
            }
            for _ in 0..cells.len().div_ceil(2) {
                let mut j = i;
                while j == i {
                    j = rand_below(&mut self.rng, cells.len());
                }
                self.negatives(cell, &cells[j], &mut out);
            }
        }
        out
    }

    fn positives(&mut self, cell: &str, out: &mut Vec<CellPair>) {
        let chars: Vec<char> = cell.chars().collect();
        for i in 0..chars.len() {
            self.emit(&chars[..i], &chars[i..], 1, out);
        }

        let fill = std::iter::repeat_n(WINDOW_FILL, WINDOW - 2);
        let padded: Vec<char> = fill.clone().chain(chars.iter().copied()).chain(fill).collect();
        for window in padded.windows(WINDOW) {
            if !window.iter().copied().any(is_cjk) {
                continue;
            }
            let inner: Vec<char> = window.iter().copied().filter(|&c| c != WINDOW_FILL).collect();
            for i in MIN_HALF..inner.len() {
                self.emit(&inner[..i], &inner[i..], 1, out);
            }
        }
    }

    fn negatives(&mut self, first: &str, second: &str, out: &mut Vec<CellPair>) {
        let first: Vec<char> = first.chars().collect();
        let second: Vec<char> = second.chars().collect();
        self.emit(&first, &second, 0, out);
        for i in 0..first.len() {
            let tail = &first[i..];
            if tail.len() >= WINDOW {
                continue;
            }
            let head = &second[..second.len().min(WINDOW - tail.len())];
            self.emit(tail, head, 0, out);
        }
    }

    fn emit(&mut self, left: &[char], right: &[char], label: i64, out: &mut Vec<CellPair>) {
        if left.len() < MIN_HALF || right.len() < MIN_HALF {
            return;
        }
        let left: String = left.iter().collect();
        let right: String = right.iter().collect();
        if !contains_cjk(&left) && !contains_cjk(&right) {
            return;
        }
        if !self.seen.insert(format!("{left}{SPLIT_TOKEN}{right}")) {
            return;
        }
        out.push(CellPair { left, right, label });
    }

    /// Whether the next table goes to the evaluation split.
    fn draw_eval(&mut self) -> bool {
        self.rng.rand_range(0..EVAL_ONE_IN) == 0
    }
}

#[derive(Debug, Default)]
pub struct CellDataset {
    pub train: Vec<CellPair>,
    pub eval: Vec<CellPair>,
}

/// Generate pairs for every table and split them by table.
pub fn build_dataset(tables: &[Vec<String>], seed: u64) -> CellDataset {
    let mut generator = PairGenerator::new(seed);
    let mut dataset = CellDataset::default();
    for cells in tables {
        let eval = generator.draw_eval();
        let pairs = generator.table(cells);
        if eval {
            dataset.eval.extend(pairs);
        } else {
            dataset.train.extend(pairs);
        }
    }
    dataset
}

/// `<UNK>`, `<PAD>`, `<a>`, `<b>`, then every character in order of first use.
pub fn build_vocab<'a>(pairs: impl IntoIterator<Item = &'a CellPair>) -> Vocab {
    let mut vocab = Vocab::from_tokens([UNK_TOKEN, PAD_TOKEN, CELL_SEPARATOR, SPLIT_TOKEN]);
    let mut buf = [0; 4];
    for pair in pairs {
        for c in pair.left.chars().chain(pair.right.chars()) {
            vocab.add(c.encode_utf8(&mut buf));
        }
    }
    vocab
}

/// Write `pairs` as cell records, one JSON object per line.
pub fn write_records(path: &Path, pairs: &[CellPair]) -> anyhow::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for pair in pairs {
        serde_json::to_writer(&mut out, &pair.to_record())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Counts of a written dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub tables: usize,
    pub train: usize,
    pub eval: usize,
    pub positives: usize,
    pub vocab_size: usize,
    pub out_dir: PathBuf,
}

/// Build and write `cell-train-1.jsonl`, `cell-eval-1.jsonl` and
/// `vocab.txt` under `out_dir`.
pub fn write_dataset(cells_text: &str, out_dir: &Path, seed: u64) -> anyhow::Result<DatasetSummary> {
    let tables = parse_tables(cells_text);
    let mut dataset = build_dataset(&tables, seed);
    let mut rng = Rand32::new(seed.wrapping_add(1));
    shuffle(&mut dataset.train, &mut rng);
    shuffle(&mut dataset.eval, &mut rng);

    fs::create_dir_all(out_dir)?;
    write_records(&out_dir.join("cell-train-1.jsonl"), &dataset.train)?;
    write_records(&out_dir.join("cell-eval-1.jsonl"), &dataset.eval)?;
    let vocab = build_vocab(dataset.train.iter().chain(&dataset.eval));
    vocab.save(out_dir.join("vocab.txt"))?;

    let summary = DatasetSummary {
        tables: tables.len(),
        train: dataset.train.len(),
        eval: dataset.eval.len(),
        positives: dataset
            .train
            .iter()
            .chain(&dataset.eval)
            .filter(|p| p.label == 1)
            .count(),
        vocab_size: vocab.len(),
        out_dir: out_dir.to_path_buf(),
    };
    info!(?summary, "cell dataset written");
    Ok(summary)
}

/// Shift every pixel of a glyph by one random delta, clipped to 0..=255.
pub fn random_brightness(image: &mut [u8], rng: &mut Rand32) {
    let span = (2 * MAX_BRIGHTNESS_DELTA + 1) as u32;
    let delta = rng.rand_range(0..span) as i16 - MAX_BRIGHTNESS_DELTA;
    for pixel in image {
        *pixel = (*pixel as i16 + delta).clamp(0, 255) as u8;
    }
}

/// Glyph source with brightness jitter applied to every record.
pub struct BrightnessJitter<S> {
    inner: S,
    rng: Rand32,
}

impl<S> BrightnessJitter<S> {
    pub fn new(inner: S, seed: u64) -> Self {
        Self {
            inner,
            rng: Rand32::new(seed),
        }
    }
}

impl<S: BatchSource<FontRecord>> BatchSource<FontRecord> for BrightnessJitter<S> {
    fn next_batch(
        &mut self,
        keep: &dyn Fn(&FontRecord) -> bool,
    ) -> anyhow::Result<Option<Vec<FontRecord>>> {
        let Some(mut batch) = self.inner.next_batch(keep)? else {
            return Ok(None);
        };
        for record in &mut batch {
            random_brightness(&mut record.image, &mut self.rng);
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tables_split_on_hash_lines() {
        let text = "营业收入<a>营业 成本<a>abc\n营业收入\n# table\n净利润\n";
        let tables = parse_tables(text);
        assert_eq!(tables, vec![cells(&["营业收入", "营业成本"]), cells(&["净利润"])]);
    }

    #[test]
    fn single_cell_gives_only_positives() {
        let mut generator = PairGenerator::new(1);
        let pairs = generator.table(&cells(&["营业收入合计"]));
        assert!(!pairs.is_empty());
        assert!(pairs.iter().all(|p| p.label == 1));
        assert!(pairs.contains(&CellPair {
            left: "营业".into(),
            right: "收入合计".into(),
            label: 1,
        }));
        assert!(pairs.iter().all(|p| p.left.chars().count() >= 2 && p.right.chars().count() >= 2));
        assert!(pairs.iter().all(|p| !p.left.contains('&') && !p.right.contains('&')));
    }

    #[test]
    fn pairs_are_unique_across_tables() {
        let mut generator = PairGenerator::new(1);
        let first = generator.table(&cells(&["营业收入", "营业成本"]));
        let second = generator.table(&cells(&["营业收入", "营业成本"]));
        assert!(first.iter().any(|p| p.label == 0));
        assert!(second.is_empty());
    }

    #[test]
    fn negatives_join_short_windows() {
        let mut generator = PairGenerator::new(1);
        let mut out = Vec::new();
        generator.negatives("本期营业收入", "上期金额合计数", &mut out);
        assert_eq!(out[0].left, "本期营业收入");
        assert_eq!(out[0].right, "上期金额合计数");
        for pair in &out[1..] {
            assert!(pair.left.chars().count() + pair.right.chars().count() <= WINDOW);
        }
        assert!(out.contains(&CellPair {
            left: "收入".into(),
            right: "上期金额合计数".into(),
            label: 0,
        }));
    }

    #[test]
    fn records_are_padded_to_ten_tokens() {
        let pair = CellPair {
            left: "营业".into(),
            right: "收入".into(),
            label: 1,
        };
        let record = pair.to_record();
        assert_eq!(record.x_l, "营 业");
        assert_eq!(record.x_r, "收 入 <PAD> <PAD> <PAD> <PAD> <PAD>");
        assert_eq!(record.l, 5);
        assert_eq!(record.tokens().len(), RECORD_TOKENS);
        assert_eq!(record.length(), 5);
    }

    #[test]
    fn vocab_starts_with_reserved_tokens() {
        let pairs = [CellPair {
            left: "营业".into(),
            right: "营收".into(),
            label: 1,
        }];
        let vocab = build_vocab(&pairs);
        assert_eq!(vocab.tokens(), &["<UNK>", "<PAD>", "<a>", "<b>", "营", "业", "收"]);
    }

    #[test]
    fn dataset_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let text = "营业收入<a>营业成本<a>净利润\n#\n资产总计<a>负债合计\n";
        let summary = write_dataset(text, dir.path(), 5).unwrap();
        assert_eq!(summary.tables, 2);
        assert!(summary.train + summary.eval > 0);
        assert!(summary.positives > 0);

        let train = fs::read_to_string(dir.path().join("cell-train-1.jsonl")).unwrap();
        let eval = fs::read_to_string(dir.path().join("cell-eval-1.jsonl")).unwrap();
        assert_eq!(train.lines().count() + eval.lines().count(), summary.train + summary.eval);
        let vocab = Vocab::load(dir.path().join("vocab.txt")).unwrap();
        assert_eq!(vocab.len(), summary.vocab_size);
    }

    #[test]
    fn brightness_stays_in_range() {
        let mut rng = Rand32::new(9);
        for _ in 0..50 {
            let mut image = vec![0u8, 10, 128, 250, 255];
            random_brightness(&mut image, &mut rng);
            let delta = image[2] as i16 - 128;
            assert!(delta.abs() <= MAX_BRIGHTNESS_DELTA);
            assert_eq!(image[1] as i16, (10 + delta).clamp(0, 255));
            assert_eq!(image[3] as i16, (250 + delta).clamp(0, 255));
        }
    }
}
