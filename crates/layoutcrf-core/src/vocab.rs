//! Token vocabularies backed by `vocab.txt`.
//!
//! Ids are assigned by first occurrence. Each model family reserves a few
//! ids of its own, listed in [`reserved`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::warn;

use crate::error::{LayoutError, Result};

pub const UNK_TOKEN: &str = "<UNK>";
pub const PAD_TOKEN: &str = "<PAD>";
pub const EOS_TOKEN: &str = "<EOS>";
pub const EOL_TOKEN: &str = "<EOL>";
pub const CELL_SEPARATOR: &str = "<a>";
pub const SPACE_TOKEN: &str = "<space>";

/// Reserved ids per model family.
pub mod reserved {
    pub const CELL_UNK: u32 = 0;
    pub const CELL_PAD: u32 = 1;

    pub const TEXT_DNN_PAD: u32 = 0;
    pub const TEXT_DNN_UNK: u32 = 1;

    /// The corpus vocabulary puts `<UNK>` at 0 ahead of the file tokens.
    pub const CORPUS_UNK: u32 = 0;
    pub const CORPUS_PAD: u32 = 1;
    pub const EOS: u32 = 2;
    pub const EOL: u32 = 3;

    /// Glyph labels outside the vocabulary.
    pub const OCR_UNK: u32 = 0;
}

/// String to id table with a reverse mapping.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
    default_id: u32,
}

impl Vocab {
    /// Build from tokens in order, skipping duplicates.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self::default();
        for token in tokens {
            vocab.push(token.into());
        }
        vocab
    }

    /// Load one token per line. Blank lines are ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_into(path.as_ref(), Self::default())
    }

    /// Load with `<UNK>` pinned to id 0 ahead of the file tokens.
    pub fn load_categorical(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_into(path.as_ref(), Self::from_tokens([UNK_TOKEN]))
    }

    fn load_into(path: &Path, mut vocab: Self) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            LayoutError::Vocab(format!("cannot open {}: {e}", path.display()))
        })?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let token = line.trim_end_matches(['\r', '\n']);
            if token.is_empty() {
                continue;
            }
            if vocab.index.contains_key(token) {
                warn!(token, "duplicate vocabulary entry skipped");
                continue;
            }
            vocab.push(token.to_string());
        }
        if vocab.is_empty() {
            return Err(LayoutError::Vocab(format!(
                "{} contains no tokens",
                path.display()
            )));
        }
        Ok(vocab)
    }

    /// Set the id returned for out-of-vocabulary tokens.
    pub fn with_default(mut self, default_id: u32) -> Self {
        self.default_id = default_id;
        self
    }

    fn push(&mut self, token: String) {
        if self.index.contains_key(&token) {
            return;
        }
        self.index.insert(token.clone(), self.tokens.len() as u32);
        self.tokens.push(token);
    }

    /// Append a token if absent and return its id.
    pub fn add(&mut self, token: &str) -> u32 {
        self.push(token.to_string());
        self.lookup(token)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for token in &self.tokens {
            writeln!(out, "{token}")?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn default_id(&self) -> u32 {
        self.default_id
    }

    pub fn get(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }

    /// Id of `token`, or the default id.
    pub fn lookup(&self, token: &str) -> u32 {
        self.get(token).unwrap_or(self.default_id)
    }

    pub fn reverse(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Token for `id`, or `<UNK>` when out of range.
    pub fn reverse_or_unk(&self, id: u32) -> &str {
        self.reverse(id).unwrap_or(UNK_TOKEN)
    }

    /// One id per character.
    pub fn encode_chars(&self, text: &str) -> Vec<u32> {
        let mut buf = [0u8; 4];
        text.chars()
            .map(|c| self.lookup(c.encode_utf8(&mut buf)))
            .collect()
    }

    pub fn encode_tokens<'a>(&self, tokens: impl IntoIterator<Item = &'a str>) -> Vec<u32> {
        tokens.into_iter().map(|t| self.lookup(t)).collect()
    }

    /// Concatenate tokens for `ids`, skipping `pad_id`.
    pub fn ids_to_string(&self, ids: &[u32], pad_id: u32) -> String {
        ids.iter()
            .filter(|&&id| id != pad_id)
            .map(|&id| self.reverse_or_unk(id))
            .collect()
    }
}

/// Split on single spaces, dropping empty pieces.
pub fn split_tokens(text: &str) -> Vec<&str> {
    text.split(' ').filter(|t| !t.is_empty()).collect()
}

/// Space-joined character form of `text`; literal spaces become `<space>`.
pub fn char_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for (i, c) in text.chars().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if c == ' ' {
            out.push_str(SPACE_TOKEN);
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_uses_default_for_unknown() {
        let vocab = Vocab::from_tokens([UNK_TOKEN, PAD_TOKEN, "表", "格"]).with_default(0);
        assert_eq!(vocab.lookup("表"), 2);
        assert_eq!(vocab.lookup("?"), 0);
        assert_eq!(vocab.reverse(3), Some("格"));
        assert_eq!(vocab.reverse(9), None);
        assert_eq!(vocab.reverse_or_unk(9), UNK_TOKEN);
    }

    #[test]
    fn load_skips_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, "<PAD>\n<UNK>\na\nb\na\n\nc\n").unwrap();

        let vocab = Vocab::load(&path).unwrap();
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.lookup("c"), 4);
    }

    #[test]
    fn categorical_reserves_unknown_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, "<PAD>\n<EOS>\n<EOL>\n你\n").unwrap();

        let vocab = Vocab::load_categorical(&path).unwrap();
        assert_eq!(vocab.lookup(PAD_TOKEN), reserved::CORPUS_PAD);
        assert_eq!(vocab.lookup(EOS_TOKEN), reserved::EOS);
        assert_eq!(vocab.lookup(EOL_TOKEN), reserved::EOL);
        assert_eq!(vocab.encode_chars("你好"), vec![4, 0]);
    }

    #[test]
    fn missing_or_empty_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Vocab::load(dir.path().join("nope.txt")),
            Err(LayoutError::Vocab(_))
        ));
        let empty = dir.path().join("empty.txt");
        std::fs::write(&empty, "\n").unwrap();
        assert!(Vocab::load(&empty).is_err());
    }

    #[test]
    fn ids_to_string_skips_padding() {
        let vocab = Vocab::from_tokens([UNK_TOKEN, PAD_TOKEN, "a", "b"]);
        assert_eq!(vocab.ids_to_string(&[2, 3, 1, 1], 1), "ab");
    }

    #[test]
    fn char_tokens_marks_spaces() {
        assert_eq!(char_tokens("合 计"), "合 <space> 计");
        assert_eq!(split_tokens("a  b <a> c"), vec!["a", "b", "<a>", "c"]);
    }

    #[test]
    fn save_then_load_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        let vocab = Vocab::from_tokens([UNK_TOKEN, PAD_TOKEN, CELL_SEPARATOR, "<b>", "元"]);
        vocab.save(&path).unwrap();
        let loaded = Vocab::load(&path).unwrap();
        assert_eq!(loaded.tokens(), vocab.tokens());
    }
}
