//! Wire formats and per-response stream workers

pub mod bitstream;
pub mod mp4frag;
pub mod responders;
