//! Character corpus for the line-break text model.
//!
//! A raw text file becomes one id stream with `<EOS>` after every line.
//! Training windows are cut from that stream at random: a window that
//! crosses a line end is a "break" example, any other window gets an
//! artificial `<EOL>` and is a "no break" example.

use std::fs;
use std::path::Path;

use oorandom::Rand32;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LayoutError, Result};
use crate::vocab::{Vocab, reserved};

/// Lines this short (in characters) are skipped.
pub const MIN_LINE_CHARS: usize = 5;

/// Ids held out at the end of the stream for evaluation.
pub const TEST_TAIL: usize = 5000;

/// Shortest window drawn by the sampler.
pub const MIN_WINDOW: usize = 9;

/// Class of a window that spans a real line end.
pub const BREAK: u32 = 0;
/// Class of a window with an inserted `<EOL>`.
pub const NO_BREAK: u32 = 1;

/// Encode every line longer than [`MIN_LINE_CHARS`] characters and
/// terminate it with `<EOS>`.
pub fn encode_corpus(text: &str, vocab: &Vocab) -> Vec<u32> {
    let mut ids = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.chars().count() <= MIN_LINE_CHARS {
            continue;
        }
        ids.extend(vocab.encode_chars(line));
        ids.push(reserved::EOS);
    }
    ids
}

/// Encode `raw` and store the id stream as JSON at `processed`.
pub fn preprocess(raw: &Path, processed: &Path, vocab: &Vocab) -> Result<Vec<u32>> {
    let text = fs::read_to_string(raw)?;
    let ids = encode_corpus(&text, vocab);
    fs::write(processed, serde_json::to_vec(&ids)?)?;
    info!(
        raw = %raw.display(),
        processed = %processed.display(),
        ids = ids.len(),
        "corpus preprocessed"
    );
    Ok(ids)
}

pub fn load_processed(path: &Path) -> Result<Vec<u32>> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Everything but the last [`TEST_TAIL`] ids for training, the tail for
/// evaluation.
pub fn split_train_test(ids: &[u32]) -> Result<(&[u32], &[u32])> {
    if ids.len() <= TEST_TAIL {
        return Err(LayoutError::Data(format!(
            "corpus has {} ids, need more than {TEST_TAIL}",
            ids.len()
        )));
    }
    Ok(ids.split_at(ids.len() - TEST_TAIL))
}

/// A padded window and its class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextWindow {
    pub ids: Vec<u32>,
    pub label: u32,
}

/// Draws labelled windows from an id stream.
#[derive(Debug, Clone)]
pub struct WindowSampler<'a> {
    data: &'a [u32],
    max_len: usize,
}

impl<'a> WindowSampler<'a> {
    pub fn new(data: &'a [u32], max_len: usize) -> Result<Self> {
        if max_len <= MIN_WINDOW {
            return Err(LayoutError::Config(format!(
                "max_seq_length must exceed {MIN_WINDOW}, got {max_len}"
            )));
        }
        if data.len() <= max_len {
            return Err(LayoutError::Data(format!(
                "corpus of {} ids is too short for windows of {max_len}",
                data.len()
            )));
        }
        Ok(Self { data, max_len })
    }

    pub fn sample(&self, rng: &mut Rand32) -> TextWindow {
        let start = rand_below(rng, self.data.len() - self.max_len);
        let length = MIN_WINDOW + rand_below(rng, self.max_len - MIN_WINDOW);
        let mut window = self.data[start..start + length].to_vec();
        let label = label_window(&mut window, || 4 + rand_below(rng, length - 4));

        window.resize(self.max_len, reserved::CORPUS_PAD);
        TextWindow { ids: window, label }
    }

    pub fn batch(&self, rng: &mut Rand32, size: usize) -> Vec<TextWindow> {
        (0..size).map(|_| self.sample(rng)).collect()
    }
}

/// Rewrite a raw window in place and return its class.
///
/// With an `<EOS>`: cut at the second one, turn the first into `<EOL>`.
/// Without: insert `<EOL>` at `insert_at()`.
fn label_window(window: &mut Vec<u32>, insert_at: impl FnOnce() -> usize) -> u32 {
    let eos: Vec<usize> = window
        .iter()
        .enumerate()
        .filter(|&(_, &id)| id == reserved::EOS)
        .map(|(i, _)| i)
        .take(2)
        .collect();
    match eos.as_slice() {
        [] => {
            let at = insert_at().min(window.len());
            window.insert(at, reserved::EOL);
            NO_BREAK
        }
        [first, rest @ ..] => {
            if let Some(&second) = rest.first() {
                window.truncate(second);
            }
            window[*first] = reserved::EOL;
            BREAK
        }
    }
}

fn rand_below(rng: &mut Rand32, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    rng.rand_range(0..n as u32) as usize
}

/// Build a prediction window from two sentences: the tail of `left`, an
/// `<EOL>`, then `right`, cut to `max_len` and padded.
pub fn join_at_break(left: &[u32], right: &[u32], max_len: usize) -> Vec<u32> {
    let right_keep = right.len().min(max_len.saturating_sub(1) / 2);
    let left_keep = left.len().min(max_len.saturating_sub(1 + right_keep));
    let mut ids = Vec::with_capacity(max_len);
    ids.extend_from_slice(&left[left.len() - left_keep..]);
    ids.push(reserved::EOL);
    ids.extend_from_slice(&right[..right_keep]);
    ids.resize(max_len, reserved::CORPUS_PAD);
    ids
}
