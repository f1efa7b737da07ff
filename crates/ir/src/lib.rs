pub mod builder;
pub mod call_graph;
pub mod cfg;
pub mod dfg;
pub mod domtree;
pub mod function;
pub mod global_variable;
pub mod inst;
pub mod ir_writer;
pub mod layout;
pub mod linkage;
pub mod loop_analysis;
pub mod metadata;
pub mod module;
pub mod types;
pub mod value;

pub use call_graph::{CallGraph, CallGraphSccs, SccBuilder};
pub use cfg::ControlFlowGraph;
pub use dfg::{Block, BlockId, DataFlowGraph};
pub use domtree::{DomTree, DominatorTreeTraversable};
pub use function::{FuncAttrs, Function, Signature};
pub use global_variable::{GlobalVariable, GlobalVariableData, GvInitializer};
pub use inst::{BinaryOp, CastOp, InstData, InstId, MarkerKind, UnaryOp};
pub use layout::Layout;
pub use linkage::Linkage;
pub use loop_analysis::{Loop, LoopTree};
pub use metadata::{CallSiteEffect, FuncMeta, ModRange};
pub use module::{FuncRef, Module};
pub use types::Type;
pub use value::{Immediate, Value, ValueId};
