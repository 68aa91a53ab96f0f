//! Resolved types attached to the validated tree, and the comparison-kind
//! reconciliation rules used when selecting typed opcodes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A resolved type as supplied by the validator. The backend never infers
/// types; it only reads these annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Void,
    Null,
    Int,
    Float,
    Double,
    Bool,
    Char,
    String,
    Array(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Set(Box<Type>),
    Class(String),
    Enum(String),
    Lambda { params: Vec<Type>, ret: Box<Type> },
    Union(Vec<Type>),
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Null => write!(f, "null"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Double => write!(f, "double"),
            Type::Bool => write!(f, "bool"),
            Type::Char => write!(f, "char"),
            Type::String => write!(f, "string"),
            Type::Array(elem) => write!(f, "{}[]", elem),
            Type::Map(key, val) => write!(f, "Map<{}, {}>", key, val),
            Type::Set(elem) => write!(f, "Set<{}>", elem),
            Type::Class(name) | Type::Enum(name) => write!(f, "{}", name),
            Type::Lambda { params, ret } => {
                write!(f, "(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") => {}", ret)
            }
            Type::Union(members) => {
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}", m)?;
                }
                Ok(())
            }
        }
    }
}

/// Backing representation the validator chose for an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnumRepr {
    Int,
    String,
}

/// The comparison category that selects a typed equality/ordering opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonKind {
    Int,
    Float,
    Double,
    Char,
    Bool,
    String,
    Object,
}

impl ComparisonKind {
    /// Promotion rank inside the numeric tower: char < int < float < double.
    fn numeric_rank(self) -> Option<u8> {
        match self {
            ComparisonKind::Char => Some(0),
            ComparisonKind::Int => Some(1),
            ComparisonKind::Float => Some(2),
            ComparisonKind::Double => Some(3),
            _ => None,
        }
    }
}

/// Classify a type for comparison purposes. `null`/`void` typed operands
/// cannot be compared; that is a validator contract violation here.
pub fn comparison_kind(
    ty: &Type,
    enum_repr: impl Fn(&str) -> Option<EnumRepr>,
) -> Result<ComparisonKind, String> {
    match ty {
        Type::Int => Ok(ComparisonKind::Int),
        Type::Float => Ok(ComparisonKind::Float),
        Type::Double => Ok(ComparisonKind::Double),
        Type::Char => Ok(ComparisonKind::Char),
        Type::Bool => Ok(ComparisonKind::Bool),
        Type::String => Ok(ComparisonKind::String),
        Type::Enum(name) => match enum_repr(name) {
            Some(EnumRepr::String) => Ok(ComparisonKind::String),
            Some(EnumRepr::Int) => Ok(ComparisonKind::Int),
            None => Err(format!("unknown enum '{}' in comparison", name)),
        },
        Type::Null | Type::Void => Err(format!("cannot compare a value of type '{}'", ty)),
        _ => Ok(ComparisonKind::Object),
    }
}

/// Reconcile the comparison kinds of two operands. Numeric kinds promote
/// to the higher rank; anything else must match exactly.
pub fn reconcile(a: ComparisonKind, b: ComparisonKind) -> Result<ComparisonKind, String> {
    if a == b {
        return Ok(a);
    }
    match (a.numeric_rank(), b.numeric_rank()) {
        (Some(ra), Some(rb)) => {
            let kind = if ra >= rb { a } else { b };
            // A mixed char comparison is carried out as int.
            if kind == ComparisonKind::Char {
                Ok(ComparisonKind::Int)
            } else {
                Ok(kind)
            }
        }
        _ => Err(format!("incompatible comparison types: {:?} vs {:?}", a, b)),
    }
}

/// Whether a map key / set element type selects the integer-specialized
/// collection opcodes.
pub fn is_integer_keyed(ty: &Type, enum_repr: impl Fn(&str) -> Option<EnumRepr>) -> bool {
    match ty {
        Type::Int | Type::Char => true,
        Type::Enum(name) => enum_repr(name) == Some(EnumRepr::Int),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_enums(_: &str) -> Option<EnumRepr> {
        None
    }

    #[test]
    fn test_comparison_kind_basics() {
        assert_eq!(
            comparison_kind(&Type::Int, no_enums),
            Ok(ComparisonKind::Int)
        );
        assert_eq!(
            comparison_kind(&Type::Array(Box::new(Type::Int)), no_enums),
            Ok(ComparisonKind::Object)
        );
        assert!(comparison_kind(&Type::Null, no_enums).is_err());
        assert!(comparison_kind(&Type::Void, no_enums).is_err());
    }

    #[test]
    fn test_enum_backing_selection() {
        let reprs = |name: &str| match name {
            "Color" => Some(EnumRepr::String),
            "Level" => Some(EnumRepr::Int),
            _ => None,
        };
        assert_eq!(
            comparison_kind(&Type::Enum("Color".into()), reprs),
            Ok(ComparisonKind::String)
        );
        assert_eq!(
            comparison_kind(&Type::Enum("Level".into()), reprs),
            Ok(ComparisonKind::Int)
        );
    }

    #[test]
    fn test_numeric_promotion() {
        assert_eq!(
            reconcile(ComparisonKind::Int, ComparisonKind::Double),
            Ok(ComparisonKind::Double)
        );
        assert_eq!(
            reconcile(ComparisonKind::Float, ComparisonKind::Int),
            Ok(ComparisonKind::Float)
        );
        assert_eq!(
            reconcile(ComparisonKind::Char, ComparisonKind::Int),
            Ok(ComparisonKind::Int)
        );
        assert_eq!(
            reconcile(ComparisonKind::Char, ComparisonKind::Char),
            Ok(ComparisonKind::Char)
        );
    }

    #[test]
    fn test_incompatible_kinds() {
        assert!(reconcile(ComparisonKind::String, ComparisonKind::Int).is_err());
        assert!(reconcile(ComparisonKind::Bool, ComparisonKind::Object).is_err());
    }

    #[test]
    fn test_integer_keyed() {
        assert!(is_integer_keyed(&Type::Int, no_enums));
        assert!(is_integer_keyed(&Type::Char, no_enums));
        assert!(!is_integer_keyed(&Type::String, no_enums));
    }
}
