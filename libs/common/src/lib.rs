//! LoopSim basic library
//!
//! Provides functions shared by the master and node services:
//! - logging setup
//! - graceful shutdown handling

pub mod logging;
pub mod shutdown;
