//! Data models for kiosk display state

mod playback;
mod ticker;

pub use playback::*;
pub use ticker::*;
