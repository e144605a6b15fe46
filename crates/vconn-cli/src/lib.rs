//! vconn CLI library
//!
//! Argument parsing, configuration files and the in-memory mesh simulation
//! behind the `vconn` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod simulation;

pub use config::{CliAppConfig, SimulationConfig};
pub use error::{CliError, Result};
pub use simulation::{run_simulation, NodeReport, SimulationReport};
