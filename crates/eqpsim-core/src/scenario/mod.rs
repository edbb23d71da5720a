//! Scenario scripts: step types, compiled plans, and the compiler.
//!
//! A scenario is a line-oriented script describing one equipment's protocol
//! behavior over a connection's lifetime. Scripts compile once into an
//! immutable [`ScenarioPlan`] that every connection referencing the same
//! file shares read-only.

mod compile;
mod plan;
mod step;

pub use compile::{CompileError, compile, compile_file};
pub use plan::ScenarioPlan;
pub use step::{EmitCount, EmitMode, FaultKind, FaultScopeSpec, ScenarioStep};
