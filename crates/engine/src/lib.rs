//! A context-sensitive specializer for whole programs.
//!
//! The engine evaluates a [`Module`] from its entry function over an emulated
//! memory. Instructions whose operands are known are folded to literals,
//! branches with known conditions lose their dead successors, calls with new
//! facts descend into specialized clones of their callee and loops may be
//! unrolled speculatively.
pub mod analysis;
pub mod block_info;
pub mod clone;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod func_info;
pub mod memory;
pub mod modref;
pub mod register;
pub mod stats;
pub mod trace;
pub mod track_info;
pub mod unroller;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use evaluator::{Engine, Halt, ProcResult};
pub use stats::Stats;
pub use trace::{TraceCategories, TraceCategory};

use debloat_ir::Module;

/// Runs the engine over `module` and returns the specialized module.
pub fn debloat(module: Module, config: EngineConfig) -> Result<(Module, Stats)> {
    let mut engine = Engine::new(module, config)?;
    engine.run();
    Ok(engine.finish())
}
