//! Line-pair records for the text merge classifier.

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, Result};
use crate::vocab::{Vocab, split_tokens};

/// Two consecutive text lines with their layout measurements.
///
/// `text` and `next_text` are space-separated tokens; `tags` label every
/// token of both texts in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextPairRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub text_length: i64,
    #[serde(default)]
    pub next_text: String,
    #[serde(default)]
    pub next_text_length: i64,
    #[serde(default)]
    pub tags: Vec<i64>,
    pub margin: [f32; 4],
    pub indent: [f32; 4],
    pub font_size: [f32; 2],
    #[serde(default)]
    pub can_merge: i64,
}

impl TextPairRecord {
    /// Both texts joined by a space and looked up token by token.
    pub fn token_ids(&self, vocab: &Vocab) -> Vec<u32> {
        let joined = format!("{} {}", self.text, self.next_text);
        vocab.encode_tokens(split_tokens(&joined))
    }

    /// `text_length + next_text_length`.
    pub fn seq_length(&self) -> Result<usize> {
        let len = self.text_length + self.next_text_length;
        if self.text_length < 0 || self.next_text_length < 0 {
            return Err(LayoutError::Data(format!(
                "negative text length {} + {}",
                self.text_length, self.next_text_length
            )));
        }
        Ok(len as usize)
    }

    /// `margin`, `indent`, `font_size` in that order.
    pub fn layout_features(&self) -> [f32; 10] {
        let mut out = [0f32; 10];
        out[..4].copy_from_slice(&self.margin);
        out[4..8].copy_from_slice(&self.indent);
        out[8..].copy_from_slice(&self.font_size);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{PAD_TOKEN, UNK_TOKEN};

    fn record() -> TextPairRecord {
        serde_json::from_str(
            r#"{"text": "本 期", "text_length": 2, "next_text": "合 计", "next_text_length": 2,
                "tags": [0, 1, 2, 3], "margin": [1, 2, 3, 4], "indent": [5, 6, 7, 8],
                "font_size": [9, 10], "can_merge": 1}"#,
        )
        .unwrap()
    }

    #[test]
    fn joins_both_texts() {
        let vocab = Vocab::from_tokens([PAD_TOKEN, UNK_TOKEN, "本", "期", "合"]).with_default(1);
        let r = record();
        assert_eq!(r.token_ids(&vocab), vec![2, 3, 4, 1]);
        assert_eq!(r.seq_length().unwrap(), 4);
    }

    #[test]
    fn layout_features_in_order() {
        let f = record().layout_features();
        assert_eq!(f, [1., 2., 3., 4., 5., 6., 7., 8., 9., 10.]);
    }

    #[test]
    fn margin_is_required() {
        assert!(serde_json::from_str::<TextPairRecord>(r#"{"text": "a"}"#).is_err());
    }
}
