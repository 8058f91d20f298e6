//! Dataflow analyses over control flow graphs.

pub mod control_flow;
pub mod use_def;

pub use self::control_flow::{ControlFlowGraph, ControlFlowNode, NodeId};
pub use self::use_def::{
    DefList, MemOriginList, RefList, StateId, UDState, UseDef, UseDefConfiguration,
    UseDefWorkSet,
};
