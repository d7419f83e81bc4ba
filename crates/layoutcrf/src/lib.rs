//! # layoutcrf
//!
//! Document layout models in one crate: the model library from
//! [`layoutcrf_core`] at the root, and the training tooling under
//! [`trainer`].
//!
//! ```no_run
//! use layoutcrf::{Request, ServedModel};
//!
//! # fn main() -> layoutcrf::Result<()> {
//! let model = ServedModel::load_latest("logs/cell-merge/export/Servo")?;
//! let answer = model.predict_one(Request::Sentences {
//!     left: "营业".into(),
//!     right: "收入".into(),
//! })?;
//! println!("{answer:?}");
//! # Ok(())
//! # }
//! ```

pub use layoutcrf_core::*;

pub use layoutcrf_trainer as trainer;
