//! # Region assembly
//!
//! Turns decoded per-line tags into paragraph blocks and table regions.
//! Both operate on line indices only; mapping indices back to page
//! geometry is left to the caller.

use std::ops::Range;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::data::LineRecord;
use crate::data::line::PATTERN_WIDTH;
use crate::error::{LayoutError, Result};
use crate::tags::{LineTag, TableTag};

/// Consecutive lines merged into one paragraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParagraphBlock {
    pub lines: Range<usize>,
    pub first_tag: LineTag,
    pub last_tag: LineTag,
}

/// Group lines into blocks.
///
/// A line joins the current block when it is tagged PARAGRAPH_MIDDLE or
/// PARAGRAPH_END, or when it is a SINGLE_LINE_PARAGRAPH directly after a
/// MIDDLE line. Every other line opens a new block.
pub fn paragraph_blocks(tags: &[LineTag]) -> Vec<ParagraphBlock> {
    let mut blocks: Vec<ParagraphBlock> = Vec::new();
    let mut last = tags.first().copied();
    for (i, &tag) in tags.iter().enumerate() {
        let joins = matches!(tag, LineTag::ParagraphMiddle | LineTag::ParagraphEnd)
            || (last == Some(LineTag::ParagraphMiddle) && tag == LineTag::SingleLineParagraph);
        match blocks.last_mut() {
            Some(block) if joins => {
                block.lines.end = i + 1;
                block.last_tag = if tag == LineTag::ParagraphMiddle {
                    LineTag::ParagraphMiddle
                } else {
                    LineTag::ParagraphEnd
                };
            }
            _ => blocks.push(ParagraphBlock {
                lines: i..i + 1,
                first_tag: tag,
                last_tag: tag,
            }),
        }
        last = Some(tag);
    }
    blocks
}

/// Per-line facts the table assembly rules look at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineInfo {
    pub text: String,
    pub column_count: usize,
    pub has_ruling_region: bool,
    pub has_top_ruling: bool,
    pub has_bottom_ruling: bool,
    /// First `pattern_match_result` slot: the line reads like a table title.
    pub starts_table: bool,
}

impl LineInfo {
    /// One entry per line of `record`; absent lists read as zero.
    pub fn from_record(record: &LineRecord) -> Vec<LineInfo> {
        let flag = |values: &[f32], i: usize| values.get(i).is_some_and(|&v| v > 0.5);
        (0..record.len())
            .map(|i| LineInfo {
                text: record.text.get(i).cloned().unwrap_or_default(),
                column_count: record.column_count.get(i).map_or(0, |&v| v.max(0.0) as usize),
                has_ruling_region: flag(&record.has_ruling_region, i),
                has_top_ruling: flag(&record.has_top_ruling, i),
                has_bottom_ruling: flag(&record.has_bottom_ruling, i),
                starts_table: flag(&record.pattern_match_result, i * PATTERN_WIDTH),
            })
            .collect()
    }
}

const TABLE_START_PATTERN: &str = concat!(
    r"(^表[(（]?[0-9]{1,2}.*)|(^表[零一二三四五六七八九十].*)",
    r"|(^(table)\s+((i|ii|iii|iv|v|vi|vii|viii|ix|I|II|III|IV|V|VI|VII|VIII|IX|Ⅰ|Ⅱ|Ⅲ|Ⅳ|Ⅴ|Ⅵ|Ⅶ|Ⅷ|Ⅸ)|(\d{1,2})).*)",
    r"|(^(the following table).*)|(.*(如下表|如下表所示|见下表)(：|:)$)|(^(下表|以下).*(：|:)$)",
    r"|(.*下表列出.*)|(.*(table)\s+\d{1,2}$)|(.*(as follows)[：:.]$)|(^表[0-9].*)|(^(图表|圖表|表格|附表).*)|(^附.*表$)|(^表:.*)",
    r"|(^表(\d{0,2})?:.*)|(.*表(一|二|三|四)$)|(.*表[(（][零一二三四五六七八九十][)）]$)",
    r"|(^(Figure|figure)(\d{1,2})?.*)|(^图(\d{0,2})?.*)|(.*统计表$)",
    r"|(.*(结果及分析|评估结果)|(^(金额|单位|数量)[:：].*(元|吨|比例：%|比率：%)$))",
);

const TABLE_END_PATTERN: &str = r"^(资料来源|来源|数据来源|注：|資料來源|注[0-9]：)";

const SIGNATURE_PATTERN: &str = r".*签名：$";

/// Table of contents heading; a region is cut before it.
const CONTENTS_HEADING: &str = "目录";

/// Share of the page a trailing run of table lines must cover to close a
/// region at an "other" line.
const LONG_RUN_RATIO: f32 = 0.8;
/// Same, for a run that starts at the first line of the page.
const LEADING_RUN_RATIO: f32 = 0.5;
/// Regions where more than this share of lines are single-column
/// `key：value` text are forms, not tables.
const FORM_LINE_RATIO: f32 = 0.6;

/// Assembles table regions from four-tag sequences.
pub struct RegionAssembler {
    table_start: Regex,
    table_end: Regex,
    signature: Regex,
}

impl RegionAssembler {
    /// # Errors
    ///
    /// Returns `LayoutError::Regex` if a keyword pattern fails to compile.
    pub fn new() -> Result<Self> {
        Ok(Self {
            table_start: Regex::new(TABLE_START_PATTERN)?,
            table_end: Regex::new(TABLE_END_PATTERN)?,
            signature: Regex::new(SIGNATURE_PATTERN)?,
        })
    }

    /// Whether `text` reads like a table title.
    pub fn is_table_start(&self, text: &str) -> bool {
        self.table_start.is_match(text.trim())
    }

    /// Whether `text` reads like a source note under a table.
    pub fn is_table_end(&self, text: &str) -> bool {
        self.table_end.is_match(text.trim())
    }

    /// Line ranges of the tables on a page.
    ///
    /// `tags` use the [`TableTag`] indices; anything outside them counts as
    /// an "other" line. A region still open at the end of the page is
    /// dropped.
    pub fn table_regions(&self, tags: &[u32], lines: &[LineInfo]) -> Result<Vec<Range<usize>>> {
        if tags.len() != lines.len() {
            return Err(LayoutError::Data(format!(
                "{} tags for {} lines",
                tags.len(),
                lines.len()
            )));
        }
        let tags: Vec<TableTag> = tags
            .iter()
            .map(|&t| TableTag::from_index(t as usize).unwrap_or(TableTag::Other))
            .collect();
        let total = tags.len() as f32;

        let mut regions = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        for (i, &tag) in tags.iter().enumerate() {
            match (open.is_empty(), tag) {
                (_, TableTag::Table) => open.push(i),
                (true, TableTag::TableEnd) => {
                    if self.keeps_single_line(lines, i) {
                        open.push(i);
                        self.close(&mut open, lines, &mut regions);
                    } else {
                        debug!(line = i, "single-line table dropped");
                    }
                }
                (false, TableTag::TableEnd) => {
                    open.push(i);
                    self.close(&mut open, lines, &mut regions);
                }
                (true, _) => {}
                (false, _) => {
                    let run = tags[..i]
                        .iter()
                        .rev()
                        .take_while(|&&t| t == TableTag::Table)
                        .count();
                    let share = run as f32 / total;
                    if share >= LONG_RUN_RATIO || (run == i && share > LEADING_RUN_RATIO) {
                        open.push(i);
                        self.close(&mut open, lines, &mut regions);
                    } else {
                        debug!(line = i, "table interrupted without an end, dropped");
                        open.clear();
                    }
                }
            }
        }
        if !open.is_empty() {
            debug!(lines = open.len(), "unterminated table dropped");
        }
        Ok(regions)
    }

    /// A lone table-end line counts as a table when it is ruled, or sits
    /// under a table title between two rulings, or is the first or last
    /// line, ruled above and below, with more than two columns.
    fn keeps_single_line(&self, lines: &[LineInfo], i: usize) -> bool {
        let line = &lines[i];
        let boxed = line.has_top_ruling && line.has_bottom_ruling;
        if line.has_ruling_region {
            return true;
        }
        if i > 0 && self.titled(&lines[i - 1]) && boxed {
            return true;
        }
        (i == 0 || i == lines.len() - 1) && boxed && line.column_count > 2
    }

    fn titled(&self, line: &LineInfo) -> bool {
        line.starts_table || self.is_table_start(&line.text)
    }

    /// Trim the collected lines and push the region if it survives.
    fn close(&self, open: &mut Vec<usize>, lines: &[LineInfo], regions: &mut Vec<Range<usize>>) {
        let mut members: Vec<usize> = open
            .drain(..)
            .take_while(|&i| lines[i].text.trim() != CONTENTS_HEADING)
            .collect();
        if members.first().is_some_and(|&i| self.titled(&lines[i])) {
            members.remove(0);
        }
        if members.last().is_some_and(|&i| self.is_table_end(&lines[i].text)) {
            members.pop();
        }
        let (Some(&first), Some(&last)) = (members.first(), members.last()) else {
            return;
        };
        if self.looks_like_form(&members, lines) {
            debug!(first, last, "form-like region dropped");
            return;
        }
        regions.push(first..last + 1);
    }

    fn looks_like_form(&self, members: &[usize], lines: &[LineInfo]) -> bool {
        // the first line of a page is never read as a signature line
        let signed = members[0]
            .checked_sub(1)
            .filter(|&prev| prev > 0)
            .is_some_and(|prev| self.signature.is_match(lines[prev].text.trim()));
        if signed {
            return true;
        }
        let key_value = members
            .iter()
            .filter(|&&i| lines[i].column_count == 1 && lines[i].text.contains('：'))
            .count();
        if key_value as f32 / members.len() as f32 > FORM_LINE_RATIO {
            return true;
        }
        members.iter().any(|&i| {
            let text: String = lines[i].text.chars().filter(|&c| c != ' ').collect();
            !text.is_empty() && text.chars().all(|c| c == '_')
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LineTag::*;

    fn line(text: &str) -> LineInfo {
        LineInfo {
            text: text.into(),
            column_count: 3,
            ..LineInfo::default()
        }
    }

    fn lines(n: usize) -> Vec<LineInfo> {
        (0..n).map(|i| line(&format!("row {i}"))).collect()
    }

    #[test]
    fn paragraphs_merge_middle_and_end() {
        let tags = [
            ParagraphStart,
            ParagraphMiddle,
            ParagraphEnd,
            Other,
            ParagraphStart,
            ParagraphMiddle,
            SingleLineParagraph,
            SingleLineParagraph,
        ];
        let blocks = paragraph_blocks(&tags);
        let ranges: Vec<Range<usize>> = blocks.iter().map(|b| b.lines.clone()).collect();
        assert_eq!(ranges, vec![0..3, 3..4, 4..7, 7..8]);
        assert_eq!(blocks[0].last_tag, ParagraphEnd);
        assert_eq!(blocks[2].last_tag, ParagraphEnd);
        assert_eq!(blocks[3].first_tag, SingleLineParagraph);
    }

    #[test]
    fn paragraphs_of_empty_page() {
        assert!(paragraph_blocks(&[]).is_empty());
    }

    #[test]
    fn table_lines_close_at_table_end() {
        let assembler = RegionAssembler::new().unwrap();
        let tags = [1, 2, 2, 3, 1, 1];
        let regions = assembler.table_regions(&tags, &lines(6)).unwrap();
        assert_eq!(regions, vec![1..4]);
    }

    #[test]
    fn lone_table_end_needs_rulings() {
        let assembler = RegionAssembler::new().unwrap();
        let tags = [1, 3, 1];
        assert!(assembler.table_regions(&tags, &lines(3)).unwrap().is_empty());

        let mut ruled = lines(3);
        ruled[1].has_ruling_region = true;
        assert_eq!(assembler.table_regions(&tags, &ruled).unwrap(), vec![1..2]);

        let mut titled = lines(3);
        titled[0].text = "表1 营业收入".into();
        titled[1].has_top_ruling = true;
        titled[1].has_bottom_ruling = true;
        assert_eq!(assembler.table_regions(&tags, &titled).unwrap(), vec![1..2]);
    }

    #[test]
    fn lone_table_end_on_page_edge() {
        let assembler = RegionAssembler::new().unwrap();
        let mut page = lines(2);
        page[0].has_top_ruling = true;
        page[0].has_bottom_ruling = true;
        assert_eq!(assembler.table_regions(&[3, 1], &page).unwrap(), vec![0..1]);
        page[0].column_count = 2;
        assert!(assembler.table_regions(&[3, 1], &page).unwrap().is_empty());
    }

    #[test]
    fn interrupted_table_kept_only_when_dominant() {
        let assembler = RegionAssembler::new().unwrap();
        let short = [2, 2, 1, 1, 1, 1];
        assert!(assembler.table_regions(&short, &lines(6)).unwrap().is_empty());

        let mostly_table = [1, 2, 2, 2, 2, 2, 2, 2, 2, 1];
        assert_eq!(
            assembler.table_regions(&mostly_table, &lines(10)).unwrap(),
            vec![1..10]
        );

        let leading = [2, 2, 2, 1, 1];
        assert_eq!(assembler.table_regions(&leading, &lines(5)).unwrap(), vec![0..4]);
    }

    #[test]
    fn unterminated_table_dropped() {
        let assembler = RegionAssembler::new().unwrap();
        assert!(assembler.table_regions(&[1, 2, 2], &lines(3)).unwrap().is_empty());
    }

    #[test]
    fn title_and_source_lines_trimmed() {
        let assembler = RegionAssembler::new().unwrap();
        let mut page = lines(5);
        page[0].text = "表2 主要财务指标".into();
        page[3].text = "资料来源：公司公告".into();
        let regions = assembler.table_regions(&[2, 2, 2, 3, 1], &page).unwrap();
        assert_eq!(regions, vec![1..3]);
    }

    #[test]
    fn forms_are_not_tables() {
        let assembler = RegionAssembler::new().unwrap();
        let mut page = lines(4);
        for info in &mut page[..3] {
            info.column_count = 1;
            info.text = "姓名：张三".into();
        }
        assert!(assembler.table_regions(&[2, 2, 3, 1], &page).unwrap().is_empty());

        let mut underline = lines(3);
        underline[1].text = "_ _ ___".into();
        assert!(assembler.table_regions(&[2, 3, 1], &underline).unwrap().is_empty());
    }

    #[test]
    fn signature_line_above_drops_region() {
        let assembler = RegionAssembler::new().unwrap();
        let mut page = lines(5);
        page[1].text = "负责人签名：".into();
        assert!(assembler.table_regions(&[1, 1, 2, 3, 1], &page).unwrap().is_empty());

        let mut first = lines(4);
        first[0].text = "负责人签名：".into();
        assert_eq!(assembler.table_regions(&[1, 2, 3, 1], &first).unwrap(), vec![1..3]);
    }

    #[test]
    fn contents_heading_cuts_region() {
        let assembler = RegionAssembler::new().unwrap();
        let mut page = lines(4);
        page[2].text = "目录".into();
        assert_eq!(assembler.table_regions(&[2, 2, 2, 3], &page).unwrap(), vec![0..2]);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let assembler = RegionAssembler::new().unwrap();
        assert!(assembler.table_regions(&[2, 3], &lines(3)).is_err());
    }

    #[test]
    fn line_info_reads_record_flags() {
        let mut record = crate::data::line::tests::uniform_page(2, 0.0, vec![1, 3]);
        record.has_ruling_region = vec![0.0, 1.0];
        record.pattern_match_result[PATTERN_WIDTH] = 1.0;
        let infos = LineInfo::from_record(&record);
        assert_eq!(infos.len(), 2);
        assert!(!infos[0].has_ruling_region);
        assert!(infos[1].has_ruling_region);
        assert!(infos[1].starts_table);
    }
}
