//! The doof instruction-set table.
//!
//! Every opcode has a fixed byte encoding and a mnemonic; both are part of
//! the wire contract with the VM. Changing any entry is a breaking format
//! change. Bytes are grouped in banks with gaps reserved for future ops.

/// Defines the opcode enum plus the mnemonic/byte lookup tables from a
/// single listing, so the three views of the wire table cannot drift.
macro_rules! opcodes {
    ($( $name:ident = $byte:literal, $mnemonic:literal; )*) => {
        /// A symbolic operation name with its fixed byte encoding.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $( $name = $byte, )*
        }

        impl Op {
            /// The numeric encoding written to the wire document.
            pub fn byte(self) -> u8 {
                self as u8
            }

            /// The mnemonic written alongside the byte in the document.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Op::$name => $mnemonic, )*
                }
            }

            pub fn from_byte(byte: u8) -> Option<Op> {
                match byte {
                    $( $byte => Some(Op::$name), )*
                    _ => None,
                }
            }

            pub fn from_mnemonic(name: &str) -> Option<Op> {
                match name {
                    $( $mnemonic => Some(Op::$name), )*
                    _ => None,
                }
            }

            /// All opcodes in table order.
            pub fn all() -> &'static [Op] {
                &[ $( Op::$name, )* ]
            }
        }
    };
}

opcodes! {
    // Control flow
    Halt = 0x00, "HALT";
    Jump = 0x01, "JUMP";
    BranchTrue = 0x02, "BRANCH_TRUE";
    BranchFalse = 0x03, "BRANCH_FALSE";
    Return = 0x04, "RETURN";

    // Load / move
    Move = 0x10, "MOVE";
    LoadConst = 0x11, "LOAD_CONST";
    LoadNull = 0x12, "LOAD_NULL";
    LoadTrue = 0x13, "LOAD_TRUE";
    LoadFalse = 0x14, "LOAD_FALSE";
    LoadInt = 0x15, "LOAD_INT";
    LoadChar = 0x16, "LOAD_CHAR";

    // Globals
    LoadGlobal = 0x18, "LOAD_GLOBAL";
    StoreGlobal = 0x19, "STORE_GLOBAL";

    // Integer arithmetic
    AddInt = 0x20, "ADD_INT";
    SubInt = 0x21, "SUB_INT";
    MulInt = 0x22, "MUL_INT";
    DivInt = 0x23, "DIV_INT";
    ModInt = 0x24, "MOD_INT";
    NegInt = 0x25, "NEG_INT";

    // Float arithmetic
    AddFloat = 0x28, "ADD_FLOAT";
    SubFloat = 0x29, "SUB_FLOAT";
    MulFloat = 0x2A, "MUL_FLOAT";
    DivFloat = 0x2B, "DIV_FLOAT";
    ModFloat = 0x2C, "MOD_FLOAT";
    NegFloat = 0x2D, "NEG_FLOAT";

    // Double arithmetic
    AddDouble = 0x30, "ADD_DOUBLE";
    SubDouble = 0x31, "SUB_DOUBLE";
    MulDouble = 0x32, "MUL_DOUBLE";
    DivDouble = 0x33, "DIV_DOUBLE";
    ModDouble = 0x34, "MOD_DOUBLE";
    NegDouble = 0x35, "NEG_DOUBLE";

    // Logic
    Not = 0x38, "NOT";

    // Integer comparison
    EqInt = 0x40, "EQ_INT";
    NeInt = 0x41, "NE_INT";
    LtInt = 0x42, "LT_INT";
    LeInt = 0x43, "LE_INT";
    GtInt = 0x44, "GT_INT";
    GeInt = 0x45, "GE_INT";

    // Float comparison
    EqFloat = 0x46, "EQ_FLOAT";
    NeFloat = 0x47, "NE_FLOAT";
    LtFloat = 0x48, "LT_FLOAT";
    LeFloat = 0x49, "LE_FLOAT";
    GtFloat = 0x4A, "GT_FLOAT";
    GeFloat = 0x4B, "GE_FLOAT";

    // Double comparison
    EqDouble = 0x4C, "EQ_DOUBLE";
    NeDouble = 0x4D, "NE_DOUBLE";
    LtDouble = 0x4E, "LT_DOUBLE";
    LeDouble = 0x4F, "LE_DOUBLE";
    GtDouble = 0x50, "GT_DOUBLE";
    GeDouble = 0x51, "GE_DOUBLE";

    // String / char / bool / object comparison
    EqString = 0x52, "EQ_STRING";
    NeString = 0x53, "NE_STRING";
    EqChar = 0x54, "EQ_CHAR";
    LtChar = 0x55, "LT_CHAR";
    LeChar = 0x56, "LE_CHAR";
    EqBool = 0x57, "EQ_BOOL";
    EqObject = 0x58, "EQ_OBJECT";

    // Numeric conversions
    IntToFloat = 0x60, "INT_TO_FLOAT";
    IntToDouble = 0x61, "INT_TO_DOUBLE";
    FloatToInt = 0x62, "FLOAT_TO_INT";
    FloatToDouble = 0x63, "FLOAT_TO_DOUBLE";
    DoubleToInt = 0x64, "DOUBLE_TO_INT";
    DoubleToFloat = 0x65, "DOUBLE_TO_FLOAT";
    CharToInt = 0x66, "CHAR_TO_INT";
    IntToChar = 0x67, "INT_TO_CHAR";

    // To-string conversions
    IntToString = 0x68, "INT_TO_STRING";
    FloatToString = 0x69, "FLOAT_TO_STRING";
    DoubleToString = 0x6A, "DOUBLE_TO_STRING";
    BoolToString = 0x6B, "BOOL_TO_STRING";
    CharToString = 0x6C, "CHAR_TO_STRING";

    // Strings
    ConcatString = 0x70, "CONCAT_STRING";
    StringLength = 0x71, "STRING_LENGTH";
    StringGet = 0x72, "STRING_GET";

    // Arrays
    NewArray = 0x78, "NEW_ARRAY";
    ArrayGet = 0x79, "ARRAY_GET";
    ArraySet = 0x7A, "ARRAY_SET";
    ArrayLength = 0x7B, "ARRAY_LENGTH";
    ArrayPush = 0x7C, "ARRAY_PUSH";

    // Objects
    NewObject = 0x80, "NEW_OBJECT";
    GetField = 0x81, "GET_FIELD";
    SetField = 0x82, "SET_FIELD";

    // Maps (generic / integer-keyed)
    NewMap = 0x88, "NEW_MAP";
    NewMapInt = 0x89, "NEW_MAP_INT";
    MapGet = 0x8A, "MAP_GET";
    MapGetInt = 0x8B, "MAP_GET_INT";
    MapSet = 0x8C, "MAP_SET";
    MapSetInt = 0x8D, "MAP_SET_INT";
    MapHas = 0x8E, "MAP_HAS";
    MapHasInt = 0x8F, "MAP_HAS_INT";
    MapDelete = 0x90, "MAP_DELETE";
    MapDeleteInt = 0x91, "MAP_DELETE_INT";
    MapSize = 0x92, "MAP_SIZE";
    MapClear = 0x93, "MAP_CLEAR";

    // Sets (generic / integer-element)
    NewSet = 0x98, "NEW_SET";
    NewSetInt = 0x99, "NEW_SET_INT";
    SetAdd = 0x9A, "SET_ADD";
    SetAddInt = 0x9B, "SET_ADD_INT";
    SetHas = 0x9C, "SET_HAS";
    SetHasInt = 0x9D, "SET_HAS_INT";
    SetDelete = 0x9E, "SET_DELETE";
    SetDeleteInt = 0x9F, "SET_DELETE_INT";
    SetSize = 0xA0, "SET_SIZE";
    SetClear = 0xA1, "SET_CLEAR";

    // Iterator protocol
    IterNew = 0xA8, "ITER_NEW";
    IterHasNext = 0xA9, "ITER_HAS_NEXT";
    IterNext = 0xAA, "ITER_NEXT";

    // Closures
    NewLambda = 0xB0, "NEW_LAMBDA";
    CallLambda = 0xB1, "CALL_LAMBDA";
    LoadCapture = 0xB2, "LOAD_CAPTURE";
    NewCell = 0xB3, "NEW_CELL";
    CellGet = 0xB4, "CELL_GET";
    CellSet = 0xB5, "CELL_SET";

    // Calls
    Call = 0xC0, "CALL";
    CallMethod = 0xC1, "CALL_METHOD";
    CallNative = 0xC2, "CALL_NATIVE";
    CallDynamic = 0xC3, "CALL_DYNAMIC";
    CallIntrinsic = 0xC4, "CALL_INTRINSIC";
}

impl Op {
    /// Branch opcodes add their offset to the current instruction pointer;
    /// other jump-bearing opcodes add it to the following instruction.
    /// The distinction drives jump resolution and must match the VM.
    pub fn is_branch(self) -> bool {
        matches!(self, Op::BranchTrue | Op::BranchFalse)
    }

    /// True for every opcode whose `bc` field is a jump offset.
    pub fn is_jump_bearing(self) -> bool {
        matches!(self, Op::Jump | Op::BranchTrue | Op::BranchFalse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_byte_roundtrip() {
        for &op in Op::all() {
            assert_eq!(Op::from_byte(op.byte()), Some(op));
        }
    }

    #[test]
    fn test_mnemonic_roundtrip() {
        for &op in Op::all() {
            assert_eq!(Op::from_mnemonic(op.mnemonic()), Some(op));
        }
    }

    #[test]
    fn test_bytes_unique() {
        let mut seen = HashSet::new();
        for &op in Op::all() {
            assert!(seen.insert(op.byte()), "duplicate byte for {:?}", op);
        }
    }

    #[test]
    fn test_mnemonics_unique() {
        let mut seen = HashSet::new();
        for &op in Op::all() {
            assert!(seen.insert(op.mnemonic()), "duplicate mnemonic for {:?}", op);
        }
    }

    #[test]
    fn test_unknown_lookups() {
        assert_eq!(Op::from_byte(0xFF), None);
        assert_eq!(Op::from_mnemonic("NO_SUCH_OP"), None);
    }

    #[test]
    fn test_branch_classification() {
        assert!(Op::BranchTrue.is_branch());
        assert!(Op::BranchFalse.is_branch());
        assert!(!Op::Jump.is_branch());
        assert!(Op::Jump.is_jump_bearing());
        assert!(!Op::Call.is_jump_bearing());
    }
}
