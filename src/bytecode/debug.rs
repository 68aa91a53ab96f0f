//! Debug information accumulated during code generation.

use serde::{Deserialize, Serialize};

/// A source position carried on validated AST nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Line number (1-based)
    pub line: u32,
    /// Column number (1-based)
    pub column: u32,
}

/// A source-map row keyed to one emitted instruction.
#[derive(Debug, Clone)]
pub struct SourceMapRow {
    /// Instruction index
    pub instruction: u32,
    /// Source file index into `DebugInfo::files`
    pub file: u16,
    pub line: u32,
    pub column: u32,
}

/// Debug record bracketing a compiled function's instruction range.
#[derive(Debug, Clone)]
pub struct FunctionDebugRecord {
    pub name: String,
    pub start_instruction: u32,
    /// One past the function's last instruction; `u32::MAX` while open.
    pub end_instruction: u32,
    pub param_count: u32,
}

/// Debug record bracketing a register's live window for one variable.
#[derive(Debug, Clone)]
pub struct VariableDebugRecord {
    pub name: String,
    /// Resolved type, rendered for the debugger
    pub ty: String,
    pub register: u8,
    pub start_instruction: u32,
    pub end_instruction: u32,
}

/// A lexical scope's instruction range.
#[derive(Debug, Clone)]
pub struct ScopeRecord {
    pub start_instruction: u32,
    pub end_instruction: u32,
    pub parent: Option<u32>,
}

/// Complete debug info for a compiled unit.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pub files: Vec<String>,
    pub source_map: Vec<SourceMapRow>,
    pub functions: Vec<FunctionDebugRecord>,
    pub variables: Vec<VariableDebugRecord>,
    pub scopes: Vec<ScopeRecord>,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a source-map row for the given instruction.
    pub fn map_instruction(&mut self, instruction: usize, loc: SourceLocation) {
        self.source_map.push(SourceMapRow {
            instruction: instruction as u32,
            file: 0,
            line: loc.line,
            column: loc.column,
        });
    }

    /// Open a function record at the given instruction; returns its index
    /// for the matching `close_function` call.
    pub fn open_function(&mut self, name: &str, start: usize, param_count: usize) -> usize {
        self.functions.push(FunctionDebugRecord {
            name: name.to_string(),
            start_instruction: start as u32,
            end_instruction: u32::MAX,
            param_count: param_count as u32,
        });
        self.functions.len() - 1
    }

    pub fn close_function(&mut self, index: usize, end: usize) {
        if let Some(record) = self.functions.get_mut(index) {
            record.end_instruction = end as u32;
        }
    }

    pub fn add_variable(
        &mut self,
        name: &str,
        ty: String,
        register: u8,
        start: usize,
        end: usize,
    ) {
        self.variables.push(VariableDebugRecord {
            name: name.to_string(),
            ty,
            register,
            start_instruction: start as u32,
            end_instruction: end as u32,
        });
    }

    pub fn add_scope(&mut self, start: usize, end: usize, parent: Option<usize>) {
        self.scopes.push(ScopeRecord {
            start_instruction: start as u32,
            end_instruction: end as u32,
            parent: parent.map(|p| p as u32),
        });
    }

    /// Find the source location mapped to an instruction: the row with the
    /// largest index not past it.
    pub fn find_location(&self, instruction: usize) -> Option<(u32, u32)> {
        let instruction = instruction as u32;
        let mut best: Option<&SourceMapRow> = None;
        for row in &self.source_map {
            if row.instruction <= instruction {
                match best {
                    Some(b) if row.instruction > b.instruction => best = Some(row),
                    None => best = Some(row),
                    _ => {}
                }
            }
        }
        best.map(|row| (row.line, row.column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_location() {
        let mut debug = DebugInfo::new();
        debug.map_instruction(0, SourceLocation { line: 1, column: 1 });
        debug.map_instruction(5, SourceLocation { line: 2, column: 5 });
        debug.map_instruction(10, SourceLocation { line: 3, column: 1 });

        assert_eq!(debug.find_location(0), Some((1, 1)));
        assert_eq!(debug.find_location(3), Some((1, 1)));
        assert_eq!(debug.find_location(5), Some((2, 5)));
        assert_eq!(debug.find_location(100), Some((3, 1)));
    }

    #[test]
    fn test_function_record_bracketing() {
        let mut debug = DebugInfo::new();
        let idx = debug.open_function("main", 0, 0);
        assert_eq!(debug.functions[idx].end_instruction, u32::MAX);
        debug.close_function(idx, 12);
        assert_eq!(debug.functions[idx].start_instruction, 0);
        assert_eq!(debug.functions[idx].end_instruction, 12);
    }
}
