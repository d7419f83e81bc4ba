//! # Conditional random field
//!
//! Training-time likelihood and inference-time Viterbi decoding for
//! linear-chain tag sequences.

mod head;
pub mod viterbi;

pub use head::CrfHead;
pub(crate) use head::{length_mask, log_sum_exp};
pub use viterbi::ViterbiDecoder;
