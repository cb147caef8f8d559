pub mod mocks;

pub use mocks::{MockSinkHandle, MockSinkService, SinkEvent};
