//! # LayoutCRF Core
//!
//! Document layout models built on candle: a page-level line tagger with a
//! CRF head, line and cell merge classifiers, a glyph OCR network and a
//! capsule classifier. Also holds the record schemas, the configuration
//! profiles, region assembly over decoded tags and the serving bundle
//! format.
//!
//! ## Quick Start
//!
//! ```rust
//! use layoutcrf_core::crf::ViterbiDecoder;
//! use layoutcrf_core::regions::paragraph_blocks;
//! use layoutcrf_core::tags::LineTag;
//!
//! let decoder = ViterbiDecoder::new(2);
//! let (path, _score) = decoder
//!     .decode(&[vec![1.0, 0.0], vec![0.0, 2.0]], &[vec![0.0, 0.0], vec![0.0, 0.0]])
//!     .unwrap();
//! assert_eq!(path, vec![0, 1]);
//!
//! let tags = [LineTag::ParagraphStart, LineTag::ParagraphMiddle, LineTag::ParagraphEnd];
//! assert_eq!(paragraph_blocks(&tags)[0].lines, 0..3);
//! ```
pub mod config;
pub mod crf;
pub mod data;
pub mod error;
pub mod metrics;
pub mod models;
pub mod nn;
pub mod regions;
pub mod serving;
pub mod tags;
pub mod vocab;

// Re-export primary API
pub use config::{Config, DataType, Encoder, ModelType, OcrNet, RnnMode};
pub use crf::{CrfHead, ViterbiDecoder};
pub use error::{LayoutError, Result};
pub use metrics::MetricSet;
pub use models::{LayoutModel, load_vocab};
pub use regions::{ParagraphBlock, RegionAssembler, paragraph_blocks};
pub use serving::{Prediction, Request, ServedModel, Signature, export_bundle, latest_export};
pub use tags::{LineTag, TableTag, TagMap};
pub use vocab::Vocab;
