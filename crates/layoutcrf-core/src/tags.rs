//! # Line tag sets
//!
//! Pages are labelled per line with [`LineTag`]. Table models train on a
//! smaller four-tag scheme ([`TableTag`]) reached through a configurable
//! [`TagMap`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, Result};

/// Layout role of a single text line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineTag {
    Unknown,
    Other,
    ParagraphStart,
    ParagraphMiddle,
    ParagraphEnd,
    SingleLineParagraph,
    ParagraphHeader,
    ParagraphFooter,
    TableStart,
    TableMiddle,
    TableEnd,
    SingleLineTable,
    ChartStart,
    ChartMiddle,
    ChartEnd,
}

impl LineTag {
    pub const NUM_TAGS: usize = 15;

    pub fn all_tags() -> &'static [LineTag] {
        &[
            LineTag::Unknown,
            LineTag::Other,
            LineTag::ParagraphStart,
            LineTag::ParagraphMiddle,
            LineTag::ParagraphEnd,
            LineTag::SingleLineParagraph,
            LineTag::ParagraphHeader,
            LineTag::ParagraphFooter,
            LineTag::TableStart,
            LineTag::TableMiddle,
            LineTag::TableEnd,
            LineTag::SingleLineTable,
            LineTag::ChartStart,
            LineTag::ChartMiddle,
            LineTag::ChartEnd,
        ]
    }

    /// Position in the label vocabulary.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::all_tags().get(idx).copied()
    }

    pub fn is_paragraph(&self) -> bool {
        matches!(
            self,
            LineTag::ParagraphStart
                | LineTag::ParagraphMiddle
                | LineTag::ParagraphEnd
                | LineTag::SingleLineParagraph
        )
    }

    pub fn is_table(&self) -> bool {
        matches!(
            self,
            LineTag::TableStart | LineTag::TableMiddle | LineTag::TableEnd | LineTag::SingleLineTable
        )
    }

    /// Tags that continue a block opened by an earlier line.
    fn continues(&self) -> Option<&'static [LineTag]> {
        match self {
            LineTag::ParagraphMiddle | LineTag::ParagraphEnd => {
                Some(&[LineTag::ParagraphStart, LineTag::ParagraphMiddle])
            }
            LineTag::TableMiddle | LineTag::TableEnd => {
                Some(&[LineTag::TableStart, LineTag::TableMiddle])
            }
            LineTag::ChartMiddle | LineTag::ChartEnd => {
                Some(&[LineTag::ChartStart, LineTag::ChartMiddle])
            }
            _ => None,
        }
    }

    /// Whether `to` may directly follow `from`.
    ///
    /// A MIDDLE or END line must follow the START or MIDDLE of the same
    /// block kind.
    pub fn is_valid_transition(from: LineTag, to: LineTag) -> bool {
        match to.continues() {
            Some(allowed) => allowed.contains(&from),
            None => true,
        }
    }

    /// Whether `tag` may open a sequence.
    pub fn is_valid_start(tag: LineTag) -> bool {
        tag.continues().is_none()
    }

    /// `[prev][curr]` mask for constrained decoding.
    pub fn transition_mask() -> Vec<Vec<bool>> {
        Self::all_tags()
            .iter()
            .map(|&from| {
                Self::all_tags()
                    .iter()
                    .map(|&to| Self::is_valid_transition(from, to))
                    .collect()
            })
            .collect()
    }
}

impl fmt::Display for LineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LineTag::Unknown => "UNKNOWN",
            LineTag::Other => "OTHER",
            LineTag::ParagraphStart => "PARAGRAPH_START",
            LineTag::ParagraphMiddle => "PARAGRAPH_MIDDLE",
            LineTag::ParagraphEnd => "PARAGRAPH_END",
            LineTag::SingleLineParagraph => "SINGLE_LINE_PARAGRAPH",
            LineTag::ParagraphHeader => "PARAGRAPH_HEADER",
            LineTag::ParagraphFooter => "PARAGRAPH_FOOTER",
            LineTag::TableStart => "TABLE_START",
            LineTag::TableMiddle => "TABLE_MIDDLE",
            LineTag::TableEnd => "TABLE_END",
            LineTag::SingleLineTable => "SINGLE_LINE_TABLE",
            LineTag::ChartStart => "CHART_START",
            LineTag::ChartMiddle => "CHART_MIDDLE",
            LineTag::ChartEnd => "CHART_END",
        };
        write!(f, "{s}")
    }
}

/// Four-tag table scheme. Index 0 is padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableTag {
    Padding,
    Other,
    Table,
    TableEnd,
}

impl TableTag {
    pub const NUM_TAGS: usize = 4;

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(TableTag::Padding),
            1 => Some(TableTag::Other),
            2 => Some(TableTag::Table),
            3 => Some(TableTag::TableEnd),
            _ => None,
        }
    }
}

/// Value returned for raw labels missing from the map.
pub const UNMAPPED: i64 = -1;

/// Raw label remapping built from `tag_keys` / `tag_values`.
///
/// An empty map passes labels through unchanged.
#[derive(Debug, Clone, Default)]
pub struct TagMap {
    table: HashMap<i64, i64>,
}

impl TagMap {
    pub fn new(keys: &[i64], values: &[i64]) -> Result<Self> {
        if keys.len() != values.len() {
            return Err(LayoutError::Config(format!(
                "tag map has {} keys and {} values",
                keys.len(),
                values.len()
            )));
        }
        Ok(Self {
            table: keys.iter().copied().zip(values.iter().copied()).collect(),
        })
    }

    pub fn is_identity(&self) -> bool {
        self.table.is_empty()
    }

    pub fn remap(&self, raw: i64) -> i64 {
        if self.is_identity() {
            return raw;
        }
        self.table.get(&raw).copied().unwrap_or(UNMAPPED)
    }

    /// Remap a whole tag sequence; an unmapped or out-of-range label is a
    /// data error.
    pub fn remap_all(&self, raw: &[i64], num_tags: usize) -> Result<Vec<u32>> {
        raw.iter()
            .map(|&r| {
                let tag = self.remap(r);
                if tag < 0 || tag as usize >= num_tags {
                    Err(LayoutError::Data(format!(
                        "label {r} maps to {tag}, outside 0..{num_tags}"
                    )))
                } else {
                    Ok(tag as u32)
                }
            })
            .collect()
    }
}
