//! Network building blocks shared by the layout models.

pub mod conv;
pub mod dense;
pub mod loss;
pub mod rnn;

pub use conv::{CrnnBlock, LineConv, LineConvBlock};
pub use dense::Dense;
pub use rnn::{BiRnn, BiRnnOutput, FinalState, RnnLayer, StackedRnn};
