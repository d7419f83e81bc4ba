//! # Record schemas
//!
//! Training records are stored one JSON object per line, with the field
//! names each model's decoder expects. Collation into padded tensors
//! happens in the models; the helpers here build the host-side buffers.

pub mod cell;
pub mod corpus;
pub mod digit;
pub mod font;
pub mod line;
pub mod text_pair;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{LayoutError, Result};

pub use cell::CellRecord;
pub use corpus::{TextWindow, WindowSampler};
pub use digit::DigitRecord;
pub use font::FontRecord;
pub use line::LineRecord;
pub use text_pair::TextPairRecord;

/// Parse one JSON-lines record.
pub fn parse_record<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line)?)
}

/// Read every non-blank line of a JSON-lines file.
pub fn read_jsonl<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| LayoutError::Data(format!("cannot open {}: {e}", path.display())))?;
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = parse_record(&line).map_err(|e| {
            LayoutError::Data(format!("{}:{}: {e}", path.display(), n + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Right-pad id sequences to the longest one; returns the flat buffer and
/// the padded length.
pub fn pad_ids(seqs: &[Vec<u32>], pad_id: u32) -> (Vec<u32>, usize) {
    let max_len = seqs.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(seqs.len() * max_len);
    for seq in seqs {
        flat.extend_from_slice(seq);
        flat.extend(std::iter::repeat_n(pad_id, max_len - seq.len()));
    }
    (flat, max_len)
}

/// Right-pad `[len][width]` matrices with zero rows to the longest one.
pub fn pad_rows(pages: &[Vec<Vec<f32>>], width: usize) -> (Vec<f32>, usize) {
    let max_len = pages.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(pages.len() * max_len * width);
    for page in pages {
        for row in page {
            flat.extend_from_slice(row);
        }
        flat.extend(std::iter::repeat_n(0.0, (max_len - page.len()) * width));
    }
    (flat, max_len)
}
