//! doof - bytecode compiler backend for the doof language
//!
//! This library lowers a validated doof syntax tree to the register-machine
//! bytecode document executed by the companion VM. Parsing and validation
//! happen upstream; the VM is a separate consumer of the JSON artifact.

pub mod bytecode;
pub mod compiler;
pub mod config;

// Re-export commonly used types
pub use bytecode::{BytecodeDocument, CompiledUnit, Instruction, Op};
pub use compiler::Codegen;
pub use config::BuildOptions;
