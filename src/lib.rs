//! Multi-echo MR thermometry of ethylene glycol phantoms.
//!
//! ```text
//!   cli ──► project / config ──► analysis::run_analysis
//!                                   │
//!        data (series table, sidecars, NIfTI) ──► thermometry ──► report / color
//! ```

pub mod analysis;
pub mod cli;
pub mod color;
pub mod config;
pub mod data;
pub mod error;
pub mod project;
pub mod report;
pub mod synthetic;
pub mod thermometry;
