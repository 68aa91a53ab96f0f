//! The versioned JSON bytecode document.
//!
//! This is the wire contract consumed by the VM: field names, field order,
//! and the opcode table must stay byte-stable across compiler changes. The
//! document can also be read back, with the mnemonic column validated
//! against the opcode table.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::debug::DebugInfo;
use super::ops::Op;
use super::{CompiledUnit, Constant};

/// Current document format version.
pub const FORMAT_VERSION: u32 = 1;

/// Error type for document read/write operations.
#[derive(Debug)]
pub enum DocumentError {
    /// Malformed JSON or a shape mismatch
    Json(serde_json::Error),
    /// Unsupported document version
    UnsupportedVersion(u32),
    /// A mnemonic not present in the opcode table
    UnknownMnemonic(String),
    /// Mnemonic and opcode byte disagree
    OpcodeMismatch { mnemonic: String, opcode: u8 },
}

impl From<serde_json::Error> for DocumentError {
    fn from(e: serde_json::Error) -> Self {
        DocumentError::Json(e)
    }
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::Json(e) => write!(f, "malformed bytecode document: {}", e),
            DocumentError::UnsupportedVersion(v) => write!(f, "unsupported version: {}", v),
            DocumentError::UnknownMnemonic(m) => write!(f, "unknown opcode mnemonic '{}'", m),
            DocumentError::OpcodeMismatch { mnemonic, opcode } => write!(
                f,
                "opcode byte {} does not match mnemonic '{}'",
                opcode, mnemonic
            ),
        }
    }
}

impl std::error::Error for DocumentError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BytecodeDocument {
    pub version: u32,
    pub metadata: DocumentMetadata,
    pub constants: Vec<ConstantRow>,
    pub functions: Vec<FunctionRow>,
    pub classes: Vec<ClassRow>,
    pub entry_point: u32,
    pub global_count: u32,
    pub instructions: Vec<InstructionRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub source_file: String,
    pub generated_at: String,
    pub compiler_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ConstantRow {
    Int(i64),
    Float(f64),
    String(String),
    Function(usize),
    Class(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRow {
    pub name: String,
    pub address: u32,
    pub end_address: u32,
    pub param_count: u32,
    pub register_count: u32,
    pub capture_count: u32,
    pub has_receiver: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRow {
    pub name: String,
    pub fields: Vec<String>,
    pub methods: Vec<MethodRow>,
    pub is_extern: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodRow {
    pub name: String,
    pub function: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionRow {
    pub opcode: u8,
    pub mnemonic: String,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSection {
    pub source_map: Vec<SourceMapEntry>,
    pub functions: Vec<FunctionDebugEntry>,
    pub variables: Vec<VariableDebugEntry>,
    pub scopes: Vec<ScopeEntry>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMapEntry {
    pub instruction: u32,
    pub file: u16,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDebugEntry {
    pub name: String,
    pub start_instruction: u32,
    pub end_instruction: u32,
    pub param_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDebugEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub register: u8,
    pub start_instruction: u32,
    pub end_instruction: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeEntry {
    pub start_instruction: u32,
    pub end_instruction: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<u32>,
}

impl BytecodeDocument {
    /// Assemble the wire document from a compiled unit.
    pub fn from_unit(unit: &CompiledUnit, generated_at: &str) -> Self {
        let constants = unit
            .constants
            .iter()
            .map(|constant| match constant {
                Constant::Int(v) => ConstantRow::Int(*v),
                Constant::Float(v) => ConstantRow::Float(*v),
                Constant::Str(v) => ConstantRow::String(v.clone()),
                Constant::Function(v) => ConstantRow::Function(*v),
                Constant::Class(v) => ConstantRow::Class(*v),
            })
            .collect();

        let functions = unit
            .functions
            .iter()
            .map(|f| FunctionRow {
                name: f.name.clone(),
                address: f.address as u32,
                end_address: f.end_address as u32,
                param_count: f.param_count as u32,
                register_count: f.register_count as u32,
                capture_count: f.capture_count as u32,
                has_receiver: f.has_receiver,
            })
            .collect();

        let classes = unit
            .classes
            .iter()
            .map(|c| ClassRow {
                name: c.name.clone(),
                fields: c.fields.clone(),
                methods: c
                    .methods
                    .iter()
                    .map(|(name, function)| MethodRow {
                        name: name.clone(),
                        function: *function,
                    })
                    .collect(),
                is_extern: c.is_extern,
            })
            .collect();

        let instructions = unit
            .instructions
            .iter()
            .enumerate()
            .map(|(index, inst)| InstructionRow {
                opcode: inst.op.byte(),
                mnemonic: inst.op.mnemonic().to_string(),
                a: inst.a,
                b: inst.b,
                c: inst.c,
                comment: unit.comments.get(&index).cloned().unwrap_or_default(),
            })
            .collect();

        let debug = if unit.emit_debug {
            Some(DebugSection::from_debug_info(&unit.debug))
        } else {
            None
        };

        BytecodeDocument {
            version: FORMAT_VERSION,
            metadata: DocumentMetadata {
                source_file: unit.source_file.clone(),
                generated_at: generated_at.to_string(),
                compiler_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            constants,
            functions,
            classes,
            entry_point: 0,
            global_count: unit.global_count as u32,
            instructions,
            debug,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("document serialization cannot fail")
    }

    /// Read a document back, validating the version and every mnemonic
    /// against the opcode table.
    pub fn from_json(data: &str) -> Result<Self, DocumentError> {
        let doc: BytecodeDocument = serde_json::from_str(data)?;
        if doc.version != FORMAT_VERSION {
            return Err(DocumentError::UnsupportedVersion(doc.version));
        }
        for row in &doc.instructions {
            let op = Op::from_mnemonic(&row.mnemonic)
                .ok_or_else(|| DocumentError::UnknownMnemonic(row.mnemonic.clone()))?;
            if op.byte() != row.opcode {
                return Err(DocumentError::OpcodeMismatch {
                    mnemonic: row.mnemonic.clone(),
                    opcode: row.opcode,
                });
            }
        }
        Ok(doc)
    }

    /// Human-readable listing of the instruction stream.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (index, row) in self.instructions.iter().enumerate() {
            out.push_str(&format!(
                "{:04}  {:<16} {:3} {:3} {:3}",
                index, row.mnemonic, row.a, row.b, row.c
            ));
            if !row.comment.is_empty() {
                out.push_str(&format!("  ; {}", row.comment));
            }
            out.push('\n');
        }
        out
    }
}

impl DebugSection {
    fn from_debug_info(debug: &DebugInfo) -> Self {
        DebugSection {
            source_map: debug
                .source_map
                .iter()
                .map(|row| SourceMapEntry {
                    instruction: row.instruction,
                    file: row.file,
                    line: row.line,
                    column: row.column,
                })
                .collect(),
            functions: debug
                .functions
                .iter()
                .map(|f| FunctionDebugEntry {
                    name: f.name.clone(),
                    start_instruction: f.start_instruction,
                    end_instruction: f.end_instruction,
                    param_count: f.param_count,
                })
                .collect(),
            variables: debug
                .variables
                .iter()
                .map(|v| VariableDebugEntry {
                    name: v.name.clone(),
                    ty: v.ty.clone(),
                    register: v.register,
                    start_instruction: v.start_instruction,
                    end_instruction: v.end_instruction,
                })
                .collect(),
            scopes: debug
                .scopes
                .iter()
                .map(|s| ScopeEntry {
                    start_instruction: s.start_instruction,
                    end_instruction: s.end_instruction,
                    parent: s.parent,
                })
                .collect(),
            files: debug.files.clone(),
        }
    }
}
