pub mod ast;
mod calls;
mod codegen;
pub mod registers;
pub mod types;

pub use codegen::Codegen;

use crate::bytecode::BytecodeDocument;
use crate::config::BuildOptions;
use std::path::Path;

/// Compile a validated program into a bytecode document.
pub fn compile(program: &ast::Program, options: &BuildOptions) -> Result<BytecodeDocument, String> {
    let codegen = if options.emit_debug {
        Codegen::new(&program.source_file)
    } else {
        Codegen::without_debug(&program.source_file)
    };
    let unit = codegen.compile(program)?;
    Ok(BytecodeDocument::from_unit(&unit, &options.generated_at()))
}

/// Read a validated-AST JSON file and compile it.
pub fn compile_file(path: &Path, options: &BuildOptions) -> Result<BytecodeDocument, String> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let program: ast::Program = serde_json::from_str(&data)
        .map_err(|e| format!("failed to parse validated AST: {}", e))?;
    compile(&program, options)
}
