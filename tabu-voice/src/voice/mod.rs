//! Audio side of the voice relay
//!
//! Device access, processing, the frame codec, and the capture and
//! playback pipelines.

pub mod audio;
pub mod capture;
pub mod codec;
pub mod device;
pub mod playback;
pub mod processor;
pub mod reorder;
