pub mod listener;
pub mod stream_in;

pub use listener::{PortClaim, PortRegistry, StreamListener};
pub use stream_in::{Block, BlockFramer, FrameLayout, NextBlock};
