pub mod api;
pub mod config;
pub mod error;
pub mod media;
pub mod recording;
pub mod rpc;
pub mod sfu;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
