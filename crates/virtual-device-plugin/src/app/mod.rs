//! Application module
//!
//! Wires the device registry, the plugin server and the background tasks
//! together and drives them until a termination signal arrives.

pub mod core;
pub mod tasks;

pub use core::Application;
pub use tasks::Tasks;
