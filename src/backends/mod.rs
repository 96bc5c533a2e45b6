//! Built-in codec implementations.

/// Software audio decoders backed by Symphonia.
pub mod software;

pub use software::{DEFAULT_INPUT_BUFFERS, SymphoniaCodec, SymphoniaRegistry};
