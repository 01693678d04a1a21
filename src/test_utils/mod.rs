//! Test utilities for `nano-detect`
//!
//! Provides synthetic notification generation, a scripted transport,
//! in-memory sinks and a stub image server for validating the capture
//! pipeline without the camera.

pub mod mock_device;
pub mod mock_server;
pub mod packet_generator;

pub use mock_device::*;
pub use mock_server::*;
pub use packet_generator::*;
