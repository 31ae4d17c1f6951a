//! Protomesh server
//!
//! Standalone control plane process: loads configuration, seeds the in-memory
//! config store from a resource file and runs the mesh engine until a shutdown
//! signal arrives.

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod startup;

pub use config::{Cli, Configuration};
pub use shutdown::ShutdownSignal;
pub use startup::{Mesh, start_mesh};
