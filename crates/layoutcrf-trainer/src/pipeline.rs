//! # Input pipelines
//!
//! Record files are listed with a glob, interleaved ten at a time one line
//! per file, parsed on a small rayon pool, filtered by the model and fed
//! through a shuffle buffer into batches. The text model reads fixed sets
//! of corpus windows instead.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use layoutcrf_core::Config;
use layoutcrf_core::data::corpus::{load_processed, preprocess, split_train_test};
use layoutcrf_core::data::{TextWindow, WindowSampler, parse_record};
use layoutcrf_core::vocab::Vocab;
use oorandom::Rand32;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// Files read concurrently by the interleave.
pub const CYCLE_LENGTH: usize = 10;
/// Worker threads parsing record lines.
pub const PARALLEL_CALLS: usize = 10;
/// Records held by the shuffle buffer outside predict mode.
pub const SHUFFLE_BUFFER: usize = 50_000;
/// Lines handed to the parser pool at once.
const PARSE_CHUNK: usize = 1024;

/// Which pass a pipeline feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Shuffled file order, repeated forever.
    Train,
    /// One shuffled pass.
    Eval,
    /// One pass in file order.
    Predict,
}

/// A stream of example batches.
pub trait BatchSource<E> {
    /// Next batch, or `None` once a single-pass source is exhausted.
    ///
    /// `keep` drops decoded examples before they enter the buffer.
    fn next_batch(&mut self, keep: &dyn Fn(&E) -> bool) -> anyhow::Result<Option<Vec<E>>>;
}

/// Batches decoded from JSON-lines record files.
pub struct RecordInput<E> {
    files: Vec<PathBuf>,
    split: Split,
    batch_size: usize,
    rng: Rand32,
    pool: rayon::ThreadPool,
    pending: VecDeque<PathBuf>,
    open: Vec<Lines<BufReader<File>>>,
    cursor: usize,
    epoch_lines: usize,
    sources_done: bool,
    buffer: VecDeque<E>,
    _record: PhantomData<fn() -> E>,
}

impl<E: DeserializeOwned + Send> RecordInput<E> {
    /// Pipeline over every file matching `pattern`.
    pub fn new(pattern: &Path, split: Split, batch_size: usize, seed: u64) -> anyhow::Result<Self> {
        let pattern_str = pattern.to_string_lossy();
        let mut files = glob::glob(&pattern_str)
            .with_context(|| format!("invalid data pattern {pattern_str}"))?
            .collect::<Result<Vec<_>, _>>()?;
        if files.is_empty() {
            bail!("no record files match {pattern_str}");
        }
        files.sort();
        info!(pattern = %pattern_str, files = files.len(), ?split, "input pipeline ready");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(PARALLEL_CALLS)
            .build()?;
        let mut input = Self {
            files,
            split,
            batch_size: batch_size.max(1),
            rng: Rand32::new(seed),
            pool,
            pending: VecDeque::new(),
            open: Vec::new(),
            cursor: 0,
            epoch_lines: 0,
            sources_done: false,
            buffer: VecDeque::new(),
            _record: PhantomData,
        };
        input.start_epoch();
        Ok(input)
    }

    /// Training or evaluation pipeline for a profile.
    pub fn from_config(config: &Config, split: Split) -> anyhow::Result<Self> {
        let pattern = match split {
            Split::Train => config.train_pattern(),
            Split::Eval | Split::Predict => config.eval_pattern(),
        };
        Self::new(&pattern, split, config.model.batch_size, config.train.seed)
    }

    fn start_epoch(&mut self) {
        let mut order = self.files.clone();
        if self.split == Split::Train {
            shuffle(&mut order, &mut self.rng);
        }
        self.pending = order.into();
        self.epoch_lines = 0;
    }

    fn open_next(&mut self) -> anyhow::Result<Option<Lines<BufReader<File>>>> {
        match self.pending.pop_front() {
            Some(path) => {
                let file = File::open(&path)
                    .with_context(|| format!("cannot open {}", path.display()))?;
                debug!(path = %path.display(), "reading record file");
                Ok(Some(BufReader::new(file).lines()))
            }
            None => Ok(None),
        }
    }

    /// Up to `n` non-blank lines, one per open file in turn.
    fn read_lines(&mut self, n: usize) -> anyhow::Result<Vec<String>> {
        let mut lines = Vec::with_capacity(n);
        while lines.len() < n {
            while self.open.len() < CYCLE_LENGTH {
                match self.open_next()? {
                    Some(reader) => self.open.push(reader),
                    None => break,
                }
            }
            if self.open.is_empty() {
                if self.split != Split::Train {
                    self.sources_done = true;
                    break;
                }
                if self.epoch_lines == 0 {
                    bail!("record files contain no lines");
                }
                self.start_epoch();
                continue;
            }

            match self.open[self.cursor].next() {
                Some(line) => {
                    let line = line?;
                    if !line.trim().is_empty() {
                        lines.push(line);
                        self.epoch_lines += 1;
                    }
                    self.cursor = (self.cursor + 1) % self.open.len();
                }
                None => {
                    match self.open_next()? {
                        Some(reader) => self.open[self.cursor] = reader,
                        None => {
                            self.open.remove(self.cursor);
                        }
                    }
                    if self.cursor >= self.open.len() {
                        self.cursor = 0;
                    }
                }
            }
        }
        Ok(lines)
    }

    fn fill(&mut self, keep: &dyn Fn(&E) -> bool) -> anyhow::Result<()> {
        let lines = self.read_lines(PARSE_CHUNK)?;
        let parsed = self.pool.install(|| {
            lines
                .par_iter()
                .map(|line| parse_record::<E>(line))
                .collect::<Result<Vec<E>, _>>()
        })?;
        self.buffer.extend(parsed.into_iter().filter(|e| keep(e)));
        Ok(())
    }

    fn buffer_capacity(&self) -> usize {
        match self.split {
            Split::Predict => self.batch_size,
            Split::Train | Split::Eval => SHUFFLE_BUFFER.max(self.batch_size),
        }
    }
}

impl<E: DeserializeOwned + Send> BatchSource<E> for RecordInput<E> {
    fn next_batch(&mut self, keep: &dyn Fn(&E) -> bool) -> anyhow::Result<Option<Vec<E>>> {
        let capacity = self.buffer_capacity();
        while self.buffer.len() < capacity && !self.sources_done {
            self.fill(keep)?;
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let next = match self.split {
                Split::Predict => self.buffer.pop_front(),
                Split::Train | Split::Eval => {
                    let at = rand_below(&mut self.rng, self.buffer.len());
                    self.buffer.swap_remove_back(at)
                }
            };
            match next {
                Some(example) => batch.push(example),
                None => break,
            }
        }
        Ok(Some(batch))
    }
}

/// Text model input: a fixed set of sampled corpus windows.
///
/// Training cycles over its batches forever, evaluation reads them once.
pub struct CorpusInput {
    batches: Vec<Vec<TextWindow>>,
    split: Split,
    next: usize,
}

impl CorpusInput {
    /// Sample `num_batches` batches of windows from `data`.
    pub fn new(
        data: &[u32],
        max_len: usize,
        batch_size: usize,
        num_batches: usize,
        split: Split,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let sampler = WindowSampler::new(data, max_len)?;
        let mut rng = Rand32::new(seed);
        let batches = (0..num_batches)
            .map(|_| sampler.batch(&mut rng, batch_size.max(1)))
            .collect();
        Ok(Self {
            batches,
            split,
            next: 0,
        })
    }

    /// Train or test windows from the profile's corpus.
    ///
    /// The processed id file is reused when present, otherwise it is built
    /// from the raw text.
    pub fn from_config(config: &Config, vocab: &Vocab, split: Split) -> anyhow::Result<Self> {
        let ids = load_corpus(config, vocab)?;
        let (train, test) = split_train_test(&ids)?;
        let (data, size, seed) = match split {
            Split::Train => (train, config.data.trainset_size, config.train.seed),
            Split::Eval | Split::Predict => {
                (test, config.data.testset_size, config.train.seed.wrapping_add(1))
            }
        };
        info!(ids = data.len(), batches = size, ?split, "corpus windows sampled");
        Self::new(data, config.data.max_seq_length, config.model.batch_size, size, split, seed)
    }
}

impl BatchSource<TextWindow> for CorpusInput {
    fn next_batch(
        &mut self,
        keep: &dyn Fn(&TextWindow) -> bool,
    ) -> anyhow::Result<Option<Vec<TextWindow>>> {
        if self.batches.is_empty() {
            return Ok(None);
        }
        if self.next == self.batches.len() {
            if self.split != Split::Train {
                return Ok(None);
            }
            self.next = 0;
        }
        let batch = self.batches[self.next].iter().filter(|w| keep(w)).cloned().collect();
        self.next += 1;
        Ok(Some(batch))
    }
}

/// Encoded corpus ids for a profile.
pub fn load_corpus(config: &Config, vocab: &Vocab) -> anyhow::Result<Vec<u32>> {
    let processed = config
        .data
        .processed_path
        .clone()
        .unwrap_or_else(|| config.data.base_path.join("processed.txt"));
    if processed.exists() {
        return Ok(load_processed(&processed)?);
    }
    let Some(raw) = config.data.raw_data_path.as_ref() else {
        bail!(
            "corpus {} does not exist and no raw_data_path is configured",
            processed.display()
        );
    };
    info!(raw = %raw.display(), processed = %processed.display(), "preprocessing corpus");
    Ok(preprocess(raw, &processed, vocab)?)
}

/// Fisher-Yates shuffle.
pub(crate) fn shuffle<T>(items: &mut [T], rng: &mut Rand32) {
    for i in (1..items.len()).rev() {
        let j = rand_below(rng, i + 1);
        items.swap(i, j);
    }
}

pub(crate) fn rand_below(rng: &mut Rand32, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    rng.rand_range(0..n as u32) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use layoutcrf_core::data::CellRecord;
    use std::io::Write;

    fn write_cells(dir: &Path, name: &str, ys: &[i64]) {
        let mut file = File::create(dir.join(name)).unwrap();
        for &y in ys {
            let record = CellRecord {
                x_l: "营 业".into(),
                x_r: "收".into(),
                y,
                l: 4,
            };
            writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
        }
    }

    fn all(_: &CellRecord) -> bool {
        true
    }

    #[test]
    fn eval_pass_reads_every_record_once() {
        let dir = tempfile::tempdir().unwrap();
        write_cells(dir.path(), "cell-eval-1.jsonl", &[0, 1, 0]);
        write_cells(dir.path(), "cell-eval-2.jsonl", &[1, 1]);

        let pattern = dir.path().join("cell-eval-*.jsonl");
        let mut input = RecordInput::<CellRecord>::new(&pattern, Split::Eval, 2, 7).unwrap();
        let mut seen = Vec::new();
        while let Some(batch) = input.next_batch(&all).unwrap() {
            assert!(batch.len() <= 2);
            seen.extend(batch.into_iter().map(|r| r.y));
        }
        seen.sort();
        assert_eq!(seen, vec![0, 0, 1, 1, 1]);
    }

    #[test]
    fn train_repeats_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_cells(dir.path(), "cell-train-1.jsonl", &[0, 1, 1]);

        let pattern = dir.path().join("cell-train-*.jsonl");
        let mut input = RecordInput::<CellRecord>::new(&pattern, Split::Train, 4, 7).unwrap();
        let positives = |r: &CellRecord| r.y == 1;
        for _ in 0..5 {
            let batch = input.next_batch(&positives).unwrap().unwrap();
            assert_eq!(batch.len(), 4);
            assert!(batch.iter().all(|r| r.y == 1));
        }
    }

    #[test]
    fn predict_keeps_file_order() {
        let dir = tempfile::tempdir().unwrap();
        write_cells(dir.path(), "a.jsonl", &[0, 1, 2]);

        let mut input =
            RecordInput::<CellRecord>::new(&dir.path().join("a.jsonl"), Split::Predict, 2, 0)
                .unwrap();
        let first = input.next_batch(&all).unwrap().unwrap();
        assert_eq!(first.iter().map(|r| r.y).collect::<Vec<_>>(), vec![0, 1]);
        let second = input.next_batch(&all).unwrap().unwrap();
        assert_eq!(second.iter().map(|r| r.y).collect::<Vec<_>>(), vec![2]);
        assert!(input.next_batch(&all).unwrap().is_none());
    }

    #[test]
    fn missing_files_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("none-*.jsonl");
        assert!(RecordInput::<CellRecord>::new(&pattern, Split::Train, 2, 0).is_err());
    }

    #[test]
    fn empty_training_files_do_not_spin() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("empty.jsonl")).unwrap();
        let mut input =
            RecordInput::<CellRecord>::new(&dir.path().join("empty.jsonl"), Split::Train, 2, 0)
                .unwrap();
        assert!(input.next_batch(&all).is_err());
    }

    #[test]
    fn corpus_eval_is_single_pass() {
        let data: Vec<u32> = (0..200).map(|i| 4 + i % 5).collect();
        let mut input = CorpusInput::new(&data, 12, 3, 2, Split::Eval, 1).unwrap();
        let keep = |_: &TextWindow| true;
        assert_eq!(input.next_batch(&keep).unwrap().unwrap().len(), 3);
        assert!(input.next_batch(&keep).unwrap().is_some());
        assert!(input.next_batch(&keep).unwrap().is_none());

        let mut train = CorpusInput::new(&data, 12, 3, 2, Split::Train, 1).unwrap();
        for _ in 0..5 {
            let batch = train.next_batch(&keep).unwrap().unwrap();
            assert!(batch.iter().all(|w| w.ids.len() == 12));
        }
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = Rand32::new(3);
        let mut items: Vec<u32> = (0..20).collect();
        shuffle(&mut items, &mut rng);
        let mut sorted = items.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }
}
