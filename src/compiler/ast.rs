//! The validated syntax tree consumed by the backend.
//!
//! Everything here is produced by the external parser/validator and handed
//! over as read-only oracle data: resolved types, call-dispatch categories,
//! capture-analysis flags, and pre-scanned parameter/local lists. The
//! backend performs no inference of its own; a missing annotation is a
//! contract violation and surfaces as a fatal compile error.

use serde::{Deserialize, Serialize};

use super::types::{EnumRepr, Type};
use crate::bytecode::SourceLocation;

/// A whole validated compilation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub source_file: String,
    /// Entry function; compiled first so the document's entry point is
    /// instruction 0.
    pub main: Function,
    #[serde(default)]
    pub globals: Vec<GlobalDecl>,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub classes: Vec<Class>,
    #[serde(default)]
    pub extern_classes: Vec<ExternClass>,
    #[serde(default)]
    pub enums: Vec<Enum>,
}

/// A module-level variable. Slot order follows declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: Type,
}

/// A declared parameter or local, pre-scanned by the validator before the
/// body is lowered. `boxed` marks bindings the capture analysis found to
/// be captured and mutated by some closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub ty: Type,
    #[serde(default)]
    pub boxed: bool,
}

/// A validated function, method, or lambda body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Binding>,
    /// Every local declared anywhere in the body, in declaration order.
    #[serde(default)]
    pub locals: Vec<Binding>,
    pub return_ty: Type,
    pub body: Vec<Stmt>,
    /// True for instance methods (receiver in register 1).
    #[serde(default)]
    pub has_receiver: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    pub fields: Vec<Binding>,
    #[serde(default)]
    pub constructor: Option<Function>,
    #[serde(default)]
    pub methods: Vec<Function>,
    #[serde(default)]
    pub static_methods: Vec<Function>,
}

/// A class implemented by the host; calls dispatch through `CALL_NATIVE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternClass {
    pub name: String,
    pub methods: Vec<ExternMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternMethod {
    pub name: String,
    pub param_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enum {
    pub name: String,
    pub repr: EnumRepr,
    pub members: Vec<EnumMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumMember {
    pub name: String,
    pub value: EnumValue,
}

/// The backing value the validator assigned to an enum member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EnumValue {
    Int(i64),
    Str(String),
}

/// A statement with its optional source position. The position becomes the
/// "current source location" while the statement lowers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(default)]
    pub loc: Option<SourceLocation>,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self { loc: None, kind }
    }

    pub fn with_loc(kind: StmtKind, line: u32, column: u32) -> Self {
        Self {
            loc: Some(SourceLocation { line, column }),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StmtKind {
    /// Initialize a pre-scanned local.
    Let { name: String, init: Expr },
    Assign { target: LValue, value: Expr },
    Expr { expr: Expr },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    While { cond: Expr, body: Vec<Stmt> },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    /// `for (var in start..end)` over an integer range.
    ForRange {
        var: String,
        start: Expr,
        end: Expr,
        inclusive: bool,
        body: Vec<Stmt>,
    },
    /// `for (var of collection)` over an array, map, or set.
    ForIn {
        var: String,
        iterable: Expr,
        /// Resolved collection type of the iterable.
        container: Type,
        body: Vec<Stmt>,
    },
    Switch {
        discriminant: Expr,
        /// Discriminant's resolved type.
        ty: Type,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
    },
    Break,
    Continue,
    Return { value: Option<Expr> },
    Block { body: Vec<Stmt> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub test: CaseTest,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CaseTest {
    /// `case expr:` — one typed equality check.
    Exact { value: Expr, ty: Type },
    /// `case lo..hi:` — two less-than checks ANDed together.
    Range {
        lo: Expr,
        hi: Expr,
        ty: Type,
        inclusive: bool,
    },
}

/// An assignment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LValue {
    Local { name: String },
    Global { name: String },
    /// Write through a boxed capture of the enclosing lambda.
    Capture { index: usize },
    Field {
        object: Expr,
        class: String,
        field: usize,
    },
    Index {
        object: Expr,
        index: Expr,
        container: Type,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    IntLit(i64),
    FloatLit(f64),
    DoubleLit(f64),
    BoolLit(bool),
    CharLit(char),
    StrLit(String),
    NullLit,
    Local { name: String },
    Global { name: String },
    This,
    /// Read a capture of the enclosing lambda. Boxed captures hold cells.
    Capture { index: usize, boxed: bool },
    Field {
        object: Box<Expr>,
        class: String,
        field: usize,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        container: Type,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        ty: Type,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        lhs_ty: Type,
        rhs_ty: Type,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call(CallExpr),
    /// Invoke a lambda value.
    Invoke {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Lambda(LambdaExpr),
    New { class: String, args: Vec<Expr> },
    /// `new Map<..>()` / `new Set<..>()`, lowered to the typed opcode.
    NewCollection { ty: Type },
    ArrayLit {
        elem_ty: Type,
        elements: Vec<Expr>,
    },
    EnumMember { enum_name: String, member: String },
    /// A validator-inserted conversion.
    Cast {
        expr: Box<Expr>,
        from: Type,
        to: Type,
    },
}

/// A validated call site. The dispatch category is oracle data; the
/// backend only routes it to the matching opcode sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallExpr {
    pub dispatch: CallDispatch,
    #[serde(default)]
    pub receiver: Option<Box<Expr>>,
    pub args: Vec<Argument>,
}

/// One argument in lexical (source) order. `position` is the declared
/// positional index the validator resolved, which differs from the lexical
/// index when the call uses named arguments out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argument {
    #[serde(default)]
    pub name: Option<String>,
    pub position: usize,
    pub expr: Expr,
}

impl Argument {
    pub fn positional(position: usize, expr: Expr) -> Self {
        Self {
            name: None,
            position,
            expr,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallDispatch {
    Intrinsic { name: String },
    Function { name: String },
    Static { class: String, method: String },
    Method { class: String, method: String },
    Native { class: String, method: String },
    Collection { container: Type, method: String },
    Union { method: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LambdaExpr {
    pub function: Function,
    pub captures: Vec<CaptureSpec>,
}

/// One captured outer binding, in capture-slot order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSpec {
    pub name: String,
    #[serde(default)]
    pub boxed: bool,
}

impl Expr {
    /// Conservative side-effect scan used by the argument-ordering rule:
    /// calls, invocations, and constructions count as effects.
    pub fn may_have_side_effects(&self) -> bool {
        match self {
            Expr::Call(_) | Expr::Invoke { .. } | Expr::New { .. } => true,
            Expr::IntLit(_)
            | Expr::FloatLit(_)
            | Expr::DoubleLit(_)
            | Expr::BoolLit(_)
            | Expr::CharLit(_)
            | Expr::StrLit(_)
            | Expr::NullLit
            | Expr::Local { .. }
            | Expr::Global { .. }
            | Expr::This
            | Expr::Capture { .. }
            | Expr::EnumMember { .. }
            | Expr::NewCollection { .. }
            | Expr::Lambda(_) => false,
            Expr::Field { object, .. } => object.may_have_side_effects(),
            Expr::Index { object, index, .. } => {
                object.may_have_side_effects() || index.may_have_side_effects()
            }
            Expr::Unary { operand, .. } => operand.may_have_side_effects(),
            Expr::Binary { lhs, rhs, .. } | Expr::Logical { lhs, rhs, .. } => {
                lhs.may_have_side_effects() || rhs.may_have_side_effects()
            }
            Expr::ArrayLit { elements, .. } => elements.iter().any(|e| e.may_have_side_effects()),
            Expr::Cast { expr, .. } => expr.may_have_side_effects(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_effect_scan() {
        let pure = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::IntLit(1)),
            rhs: Box::new(Expr::Local {
                name: "x".to_string(),
            }),
            lhs_ty: Type::Int,
            rhs_ty: Type::Int,
        };
        assert!(!pure.may_have_side_effects());

        let call = Expr::Call(CallExpr {
            dispatch: CallDispatch::Function {
                name: "g".to_string(),
            },
            receiver: None,
            args: vec![],
        });
        let nested = Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(call),
            ty: Type::Int,
        };
        assert!(nested.may_have_side_effects());
    }
}
