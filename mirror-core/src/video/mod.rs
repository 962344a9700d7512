//! H.264 parameter-set handling, decode, and color conversion (spec.md
//! section 4.4).

pub mod colorconvert;
pub mod decoder;
pub mod parameters;

pub use decoder::{Backend, DecodedFrame, H264Decoder, NalInput};
pub use parameters::{ParameterCache, ParameterSet};
