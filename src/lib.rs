//! Kestrel: a binary rewriting and analysis core in Rust.
//!
//! Kestrel ingests an already-disassembled AArch64 executable and reasons
//! about its control and data flow at the instruction level. A quick synopsis
//! of Kestrel's modules:
//!
//! * **analysis** - A use-def dataflow engine over control flow graphs.
//! * **arch** - Physical register model for the supported architecture.
//! * **archive** - A tagged byte codec for instruction semantics and links.
//! * **chunk** - The analyzed-entity graph: modules, functions, blocks,
//!   instructions, data sections, and the links between them.
//! * **elf** - Narrow views of symbols, symbol versions and relocations, as
//!   produced by an ELF loader.
//! * **instr** - The decoded instruction and operand model.
//! * **loader** - Bridges to a loader emulator for synthetic symbols.
//! * **tree** - Symbolic expression trees and memory-location
//!   canonicalization.
//!
//! ```
//! use kestrel::analysis::{ControlFlowGraph, UseDef, UseDefConfiguration, UseDefWorkSet};
//! use kestrel::tree::TreeFactory;
//! ```

#[macro_use]
extern crate log;

pub mod analysis;
pub mod arch;
pub mod archive;
pub mod chunk;
pub mod elf;
pub mod instr;
pub mod loader;
pub mod tree;

mod error;

pub use crate::error::{Error, Result};
