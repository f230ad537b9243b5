//! Self-describing int8 inference artifact (`.rsq`).
//!
//! ```text
//! b"RSQ1" | header length (u64, little endian) | JSON header | data section
//! ```
//!
//! Weights are stored as symmetric int8 with one scale per output channel;
//! biases stay in `f32`. Activations are computed in `f32`.

mod format;
mod interpreter;
mod quantize;

pub use format::*;
pub use interpreter::*;
pub use quantize::*;
