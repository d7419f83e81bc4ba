//! Cell-pair records for the table cell merge classifier.

use serde::{Deserialize, Serialize};

use crate::vocab::{CELL_SEPARATOR, Vocab, split_tokens};

/// Left and right cell texts as space-separated tokens, with the merge
/// label `y` and token count `l`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub x_l: String,
    pub x_r: String,
    #[serde(default)]
    pub y: i64,
    pub l: i64,
}

impl CellRecord {
    /// Token sequence `x_l <a> x_r`.
    pub fn tokens(&self) -> Vec<&str> {
        let mut tokens = split_tokens(&self.x_l);
        tokens.push(CELL_SEPARATOR);
        tokens.extend(split_tokens(&self.x_r));
        tokens
    }

    pub fn token_ids(&self, vocab: &Vocab) -> Vec<u32> {
        vocab.encode_tokens(self.tokens())
    }

    /// Valid length for the recurrent pass, clamped to the token count.
    pub fn length(&self) -> usize {
        (self.l.max(0) as usize).min(self.tokens().len())
    }
}
