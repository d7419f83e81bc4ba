//! Page records for the line tagger.

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, Result};
use crate::vocab::{PAD_TOKEN, Vocab, split_tokens};

/// Values per line contributed by `pattern_match_result`.
pub const PATTERN_WIDTH: usize = 9;

/// Width of one line feature vector.
pub const LINE_FEATURE_WIDTH: usize = 46 + PATTERN_WIDTH;

/// One page: per-line feature lists of equal length `line_count`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineRecord {
    pub line_count: i64,
    pub tags: Vec<i64>,
    pub text: Vec<String>,
    pub text_length: Vec<i64>,

    pub font_size: Vec<f32>,
    pub bold: Vec<f32>,
    pub italic: Vec<f32>,
    pub column_count: Vec<f32>,
    pub left: Vec<f32>,
    pub top: Vec<f32>,
    pub width: Vec<f32>,
    pub height: Vec<f32>,
    pub left_diff: Vec<f32>,
    pub right_diff: Vec<f32>,
    pub prev_left_diff: Vec<f32>,
    pub prev_right_diff: Vec<f32>,
    pub prev_top_diff: Vec<f32>,
    pub prev_bottom_diff: Vec<f32>,
    pub next_left_diff: Vec<f32>,
    pub next_right_diff: Vec<f32>,
    pub next_top_diff: Vec<f32>,
    pub next_bottom_diff: Vec<f32>,
    pub has_top_ruling: Vec<f32>,
    pub has_bottom_ruling: Vec<f32>,
    pub number_num: Vec<f32>,
    pub number_ratio: Vec<f32>,
    /// `PATTERN_WIDTH` values per line, line-major.
    pub pattern_match_result: Vec<f32>,
    pub has_fill_area: Vec<f32>,
    pub has_ruling_region: Vec<f32>,

    pub left_layout: Vec<f32>,
    pub top_layout: Vec<f32>,
    pub width_layout: Vec<f32>,
    pub height_layout: Vec<f32>,
    pub left_diff_layout: Vec<f32>,
    pub right_diff_layout: Vec<f32>,
    pub pre_left_diff_layout: Vec<f32>,
    pub pre_right_diff_layout: Vec<f32>,
    pub pre_top_diff_layout: Vec<f32>,
    pub pre_bottom_diff_layout: Vec<f32>,
    pub next_left_diff_layout: Vec<f32>,
    pub next_right_diff_layout: Vec<f32>,
    pub next_top_diff_layout: Vec<f32>,
    pub next_bottom_diff_layout: Vec<f32>,

    pub has_bottom_space_line: Vec<f32>,
    pub has_top_space_line: Vec<f32>,
    pub has_prev_similar_table_line: Vec<f32>,
    pub has_next_similar_table_line: Vec<f32>,
    pub prev_space_num_ratio: Vec<f32>,
    pub next_space_num_ratio: Vec<f32>,
    pub number_text_chunks: Vec<f32>,
    pub space_ratio: Vec<f32>,
}

impl LineRecord {
    /// Number of lines, negative counts read as empty.
    pub fn len(&self) -> usize {
        self.line_count.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feature lists in vector order with their per-line width.
    fn columns(&self) -> [(&'static str, &[f32], usize); 47] {
        [
            ("font_size", &self.font_size, 1),
            ("bold", &self.bold, 1),
            ("italic", &self.italic, 1),
            ("column_count", &self.column_count, 1),
            ("left", &self.left, 1),
            ("top", &self.top, 1),
            ("width", &self.width, 1),
            ("height", &self.height, 1),
            ("left_diff", &self.left_diff, 1),
            ("right_diff", &self.right_diff, 1),
            ("prev_left_diff", &self.prev_left_diff, 1),
            ("prev_right_diff", &self.prev_right_diff, 1),
            ("prev_top_diff", &self.prev_top_diff, 1),
            ("prev_bottom_diff", &self.prev_bottom_diff, 1),
            ("next_left_diff", &self.next_left_diff, 1),
            ("next_right_diff", &self.next_right_diff, 1),
            ("next_top_diff", &self.next_top_diff, 1),
            ("next_bottom_diff", &self.next_bottom_diff, 1),
            ("has_top_ruling", &self.has_top_ruling, 1),
            ("has_bottom_ruling", &self.has_bottom_ruling, 1),
            ("number_num", &self.number_num, 1),
            ("number_ratio", &self.number_ratio, 1),
            ("pattern_match_result", &self.pattern_match_result, PATTERN_WIDTH),
            ("has_fill_area", &self.has_fill_area, 1),
            ("has_ruling_region", &self.has_ruling_region, 1),
            ("left_layout", &self.left_layout, 1),
            ("top_layout", &self.top_layout, 1),
            ("width_layout", &self.width_layout, 1),
            ("height_layout", &self.height_layout, 1),
            ("left_diff_layout", &self.left_diff_layout, 1),
            ("right_diff_layout", &self.right_diff_layout, 1),
            ("pre_left_diff_layout", &self.pre_left_diff_layout, 1),
            ("pre_right_diff_layout", &self.pre_right_diff_layout, 1),
            ("pre_top_diff_layout", &self.pre_top_diff_layout, 1),
            ("pre_bottom_diff_layout", &self.pre_bottom_diff_layout, 1),
            ("next_left_diff_layout", &self.next_left_diff_layout, 1),
            ("next_right_diff_layout", &self.next_right_diff_layout, 1),
            ("next_top_diff_layout", &self.next_top_diff_layout, 1),
            ("next_bottom_diff_layout", &self.next_bottom_diff_layout, 1),
            ("has_bottom_space_line", &self.has_bottom_space_line, 1),
            ("has_top_space_line", &self.has_top_space_line, 1),
            ("has_prev_similar_table_line", &self.has_prev_similar_table_line, 1),
            ("has_next_similar_table_line", &self.has_next_similar_table_line, 1),
            ("prev_space_num_ratio", &self.prev_space_num_ratio, 1),
            ("next_space_num_ratio", &self.next_space_num_ratio, 1),
            ("number_text_chunks", &self.number_text_chunks, 1),
            ("space_ratio", &self.space_ratio, 1),
        ]
    }

    /// `[line_count][LINE_FEATURE_WIDTH]` feature vectors.
    pub fn feature_matrix(&self) -> Result<Vec<Vec<f32>>> {
        let lines = self.len();
        let columns = self.columns();
        for (name, values, width) in &columns {
            if values.len() < lines * width {
                return Err(LayoutError::Data(format!(
                    "{name} has {} values for {lines} lines",
                    values.len()
                )));
            }
        }
        Ok((0..lines)
            .map(|i| {
                let mut row = Vec::with_capacity(LINE_FEATURE_WIDTH);
                for (_, values, width) in &columns {
                    row.extend_from_slice(&values[i * width..(i + 1) * width]);
                }
                row
            })
            .collect())
    }

    /// Raw tags truncated to `line_count`.
    pub fn line_tags(&self) -> Result<&[i64]> {
        let lines = self.len();
        if self.tags.len() < lines {
            return Err(LayoutError::Data(format!(
                "tags has {} values for {lines} lines",
                self.tags.len()
            )));
        }
        Ok(&self.tags[..lines])
    }

    /// Per-line text token ids, padded or cut to `width`; missing lines
    /// are all padding.
    pub fn text_vectors(&self, vocab: &Vocab, width: usize) -> Vec<Vec<f32>> {
        let pad = vocab.lookup(PAD_TOKEN) as f32;
        (0..self.len())
            .map(|i| {
                let mut row: Vec<f32> = self
                    .text
                    .get(i)
                    .map(|text| {
                        split_tokens(text)
                            .into_iter()
                            .take(width)
                            .map(|t| vocab.lookup(t) as f32)
                            .collect()
                    })
                    .unwrap_or_default();
                row.resize(width, pad);
                row
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A page whose features are all `value`.
    pub(crate) fn uniform_page(lines: usize, value: f32, tags: Vec<i64>) -> LineRecord {
        let mut record = LineRecord {
            line_count: lines as i64,
            tags,
            ..Default::default()
        };
        let column = vec![value; lines];
        record.font_size = column.clone();
        record.bold = column.clone();
        record.italic = column.clone();
        record.column_count = column.clone();
        record.left = column.clone();
        record.top = column.clone();
        record.width = column.clone();
        record.height = column.clone();
        record.left_diff = column.clone();
        record.right_diff = column.clone();
        record.prev_left_diff = column.clone();
        record.prev_right_diff = column.clone();
        record.prev_top_diff = column.clone();
        record.prev_bottom_diff = column.clone();
        record.next_left_diff = column.clone();
        record.next_right_diff = column.clone();
        record.next_top_diff = column.clone();
        record.next_bottom_diff = column.clone();
        record.has_top_ruling = column.clone();
        record.has_bottom_ruling = column.clone();
        record.number_num = column.clone();
        record.number_ratio = column.clone();
        record.pattern_match_result = vec![value; lines * PATTERN_WIDTH];
        record.has_fill_area = column.clone();
        record.has_ruling_region = column.clone();
        record.left_layout = column.clone();
        record.top_layout = column.clone();
        record.width_layout = column.clone();
        record.height_layout = column.clone();
        record.left_diff_layout = column.clone();
        record.right_diff_layout = column.clone();
        record.pre_left_diff_layout = column.clone();
        record.pre_right_diff_layout = column.clone();
        record.pre_top_diff_layout = column.clone();
        record.pre_bottom_diff_layout = column.clone();
        record.next_left_diff_layout = column.clone();
        record.next_right_diff_layout = column.clone();
        record.next_top_diff_layout = column.clone();
        record.next_bottom_diff_layout = column.clone();
        record.has_bottom_space_line = column.clone();
        record.has_top_space_line = column.clone();
        record.has_prev_similar_table_line = column.clone();
        record.has_next_similar_table_line = column.clone();
        record.prev_space_num_ratio = column.clone();
        record.next_space_num_ratio = column.clone();
        record.number_text_chunks = column.clone();
        record.space_ratio = column;
        record
    }

    #[test]
    fn feature_width_is_fifty_five() {
        let record = uniform_page(3, 0.5, vec![1, 2, 3]);
        let matrix = record.feature_matrix().unwrap();
        assert_eq!(matrix.len(), 3);
        assert!(matrix.iter().all(|row| row.len() == LINE_FEATURE_WIDTH));
        assert_eq!(LINE_FEATURE_WIDTH, 55);
    }

    #[test]
    fn pattern_columns_follow_ruling_flags() {
        let mut record = uniform_page(2, 0.0, vec![1, 1]);
        record.has_bottom_ruling = vec![7.0, 8.0];
        record.pattern_match_result = (0..18).map(|v| v as f32).collect();
        record.has_fill_area = vec![-1.0, -2.0];

        let matrix = record.feature_matrix().unwrap();
        assert_eq!(matrix[1][19], 8.0);
        assert_eq!(&matrix[1][22..31], &[9., 10., 11., 12., 13., 14., 15., 16., 17.]);
        assert_eq!(matrix[1][31], -2.0);
    }

    #[test]
    fn short_list_is_error() {
        let mut record = uniform_page(2, 1.0, vec![1, 1]);
        record.space_ratio.pop();
        let err = record.feature_matrix().unwrap_err();
        assert!(err.to_string().contains("space_ratio"));

        let record = uniform_page(2, 1.0, vec![1]);
        assert!(record.line_tags().is_err());
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let record: LineRecord = serde_json::from_str(r#"{"line_count": 0}"#).unwrap();
        assert!(record.is_empty());
        assert!(record.feature_matrix().unwrap().is_empty());

        let record: LineRecord = serde_json::from_str(r#"{"tags": [1]}"#).unwrap();
        assert_eq!(record.line_count, 0);
    }

    #[test]
    fn text_vectors_pad_to_width() {
        let vocab = Vocab::from_tokens(["<UNK>", PAD_TOKEN, "合", "计"]);
        let mut record = uniform_page(2, 0.0, vec![1, 1]);
        record.text = vec!["合 计 x".into()];
        let rows = record.text_vectors(&vocab, 4);
        assert_eq!(rows[0], vec![2.0, 3.0, 0.0, 1.0]);
        assert_eq!(rows[1], vec![1.0; 4]);
    }
}
