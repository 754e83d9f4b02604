//! CLI subcommand implementations for event-courier.
//!
//! - [`simulate`] - drive simulated clients against a running server
//!
//! The `serve` command lives in `main.rs` since it only wires the
//! library together.

pub mod simulate;

#[doc(inline)]
pub use simulate::{run as run_simulation, SimulateArgs, SimulationSummary};
