//! # Viterbi decoding
//!
//! Finds the highest scoring tag path given per-position emission scores
//! and a `[prev][curr]` transition matrix, optionally restricted by a
//! transition mask.

use crate::error::{LayoutError, Result};

/// Viterbi decoder over dense score matrices.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
    allowed: Option<Vec<Vec<bool>>>,
}

impl ViterbiDecoder {
    pub fn new(num_tags: usize) -> Self {
        Self {
            num_tags,
            allowed: None,
        }
    }

    /// Forbid transitions where `allowed[prev][curr]` is false.
    pub fn with_constraints(mut self, allowed: Vec<Vec<bool>>) -> Result<Self> {
        if allowed.len() != self.num_tags || allowed.iter().any(|row| row.len() != self.num_tags) {
            return Err(LayoutError::Config(format!(
                "transition mask must be {0}x{0}",
                self.num_tags
            )));
        }
        self.allowed = Some(allowed);
        Ok(self)
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    fn is_allowed(&self, prev: usize, curr: usize) -> bool {
        self.allowed.as_ref().is_none_or(|mask| mask[prev][curr])
    }

    /// Decode the best path and its unnormalized score.
    ///
    /// # Arguments
    /// * `emission_scores` - `[seq_len][num_tags]`
    /// * `transition_matrix` - `[num_tags][num_tags]`, indexed `[prev][curr]`
    ///
    /// An empty sequence decodes to an empty path with score 0.
    pub fn decode(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<(Vec<usize>, f32)> {
        let seq_len = emission_scores.len();
        if seq_len == 0 {
            return Ok((Vec::new(), 0.0));
        }

        if let Some(row) = emission_scores.iter().find(|r| r.len() != self.num_tags) {
            return Err(LayoutError::Data(format!(
                "emission score dimension mismatch: expected {}, got {}",
                self.num_tags,
                row.len()
            )));
        }
        if transition_matrix.len() != self.num_tags
            || transition_matrix.iter().any(|r| r.len() != self.num_tags)
        {
            return Err(LayoutError::Data(format!(
                "transition matrix must be {0}x{0}",
                self.num_tags
            )));
        }

        let mut score = emission_scores[0].clone();
        let mut backptr: Vec<Vec<usize>> = Vec::with_capacity(seq_len);

        for emissions in &emission_scores[1..] {
            let mut next = vec![f32::NEG_INFINITY; self.num_tags];
            let mut best = vec![0usize; self.num_tags];

            for curr in 0..self.num_tags {
                for prev in 0..self.num_tags {
                    if !self.is_allowed(prev, curr) {
                        continue;
                    }
                    let s = score[prev] + transition_matrix[prev][curr];
                    if s > next[curr] {
                        next[curr] = s;
                        best[curr] = prev;
                    }
                }
                next[curr] += emissions[curr];
            }

            backptr.push(best);
            score = next;
        }

        let (mut tag, best_score) = score
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, s)| {
                if s > acc.1 { (i, s) } else { acc }
            });

        let mut path = Vec::with_capacity(seq_len);
        path.push(tag);
        for best in backptr.iter().rev() {
            tag = best[tag];
            path.push(tag);
        }
        path.reverse();

        Ok((path, best_score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::LineTag;

    fn zeros(n: usize) -> Vec<Vec<f32>> {
        vec![vec![0.0; n]; n]
    }

    #[test]
    fn empty_sequence() {
        let decoder = ViterbiDecoder::new(4);
        let (path, score) = decoder.decode(&[], &zeros(4)).unwrap();
        assert!(path.is_empty());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn single_step_is_argmax() {
        let decoder = ViterbiDecoder::new(4);
        let (path, score) = decoder
            .decode(&[vec![0.1, 0.2, 1.5, -1.0]], &zeros(4))
            .unwrap();
        assert_eq!(path, vec![2]);
        assert!((score - 1.5).abs() < 1e-6);
    }

    #[test]
    fn transitions_override_emissions() {
        let decoder = ViterbiDecoder::new(2);
        // Staying on tag 0 is strongly rewarded.
        let transitions = vec![vec![5.0, -5.0], vec![-5.0, 0.0]];
        let emissions = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 1.0]];
        let (path, score) = decoder.decode(&emissions, &transitions).unwrap();
        assert_eq!(path, vec![0, 0, 0]);
        assert!((score - 11.0).abs() < 1e-5);
    }

    #[test]
    fn constraints_are_respected() {
        let decoder = ViterbiDecoder::new(LineTag::NUM_TAGS)
            .with_constraints(LineTag::transition_mask())
            .unwrap();
        let mut emissions = vec![vec![0.0; LineTag::NUM_TAGS]; 2];
        emissions[0][LineTag::Other.index()] = 2.0;
        emissions[1][LineTag::ParagraphMiddle.index()] = 2.0;
        emissions[1][LineTag::SingleLineParagraph.index()] = 1.0;

        let (path, _) = decoder
            .decode(&emissions, &zeros(LineTag::NUM_TAGS))
            .unwrap();
        assert_eq!(path[0], LineTag::Other.index());
        assert_ne!(path[1], LineTag::ParagraphMiddle.index());
    }

    #[test]
    fn dimension_mismatch_is_error() {
        let decoder = ViterbiDecoder::new(3);
        assert!(decoder.decode(&[vec![0.0; 2]], &zeros(3)).is_err());
        assert!(decoder.decode(&[vec![0.0; 3]], &zeros(2)).is_err());
        assert!(ViterbiDecoder::new(3).with_constraints(vec![vec![true; 3]]).is_err());
    }
}
