//! Per-connection protocol simulation engine for the EQP simulator.
//!
//! This crate is Sans-IO: it compiles scenario scripts into immutable plans
//! and executes them as an action-based state machine, one per connection.
//! The transport layer feeds it decoded frames and timer expirations; it
//! answers with actions (transmit these chunks, start/cancel this timer,
//! close). Nothing here touches a socket.
//!
//! ## Architecture
//!
//! ```text
//! eqpsim-core
//!   ├─ Environment        (time/randomness abstraction)
//!   ├─ ScenarioPlan       (compiled steps + label index, shared read-only)
//!   ├─ FaultState         (per-connection delay/drop/corrupt/fragment)
//!   └─ ScenarioRunner     (step-execution state machine, action-based)
//! ```

pub mod env;
pub mod fault;
pub mod runner;
pub mod scenario;
pub mod template;

#[cfg(test)]
pub(crate) mod test_env;

pub use env::Environment;
pub use fault::{FaultScope, FaultState};
pub use runner::{CloseReason, EqpContext, RunnerAction, ScenarioRunner, TimerId};
pub use scenario::{
    CompileError, EmitCount, EmitMode, FaultKind, FaultScopeSpec, ScenarioPlan, ScenarioStep,
    compile,
};
