//! Register-bytecode instruction set
//!
//! Each instruction is an opcode plus one of five operand formats:
//!
//! - `Abc { a, b, c }` - three-operand form; `a` is almost always the
//!   destination register, `b`/`c` are source registers, constant-pool
//!   indices or small immediates depending on the opcode
//! - `Abx { a, bx }` - register + wide unsigned operand (constant index)
//! - `Asbx { a, sbx }` - register + signed jump offset
//! - `Ax { ax }` - packed 32-bit operand; used by the fused
//!   compare-and-jump family, which keeps its jump offset in the upper
//!   16 bits so the cleanup pass can repair it in place
//! - `Call { dst, func, argc }` - call-shaped instructions
//!
//! Fused arithmetic (`Fused*`) computes `r[a] = r[a] OP2 (r[b] OP1 r[c])`
//! where the opcode name reads inner-op-then-outer-op (`MulAdd` is
//! "multiply, then add into the destination").

use serde::{Deserialize, Serialize};

/// Runtime tags checked by `TestTag` when matching option/result values
pub mod tag {
    pub const SOME: u16 = 0;
    pub const NONE: u16 = 1;
    pub const OK: u16 = 2;
    pub const ERR: u16 = 3;
}

/// Target tags for the `Cast` opcode
pub mod cast {
    pub const INT: u16 = 0;
    pub const FLOAT: u16 = 1;
    pub const BOOL: u16 = 2;
    pub const CHAR: u16 = 3;
    pub const STR: u16 = 4;
}

/// Comparison operator carried by compare and compare-and-jump opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The operator that holds when operands are swapped (a < b == b > a)
    pub fn swapped(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    /// The operator that fails exactly when this one holds
    pub fn negated(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Inner/outer operator pairs for fused arithmetic.
///
/// The name reads inner-then-outer: `MulAdd` executes the multiply on
/// `(b, c)` and adds the product into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusedOp {
    AddAdd,
    MulAdd,
    MulSub,
    SubSub,
    SubMul,
    DivAdd,
    AddSub,
    AddMul,
    SubDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Placeholder left by optimizer passes; removed by cleanup
    NoOp,

    // Constants and moves
    LoadK,
    LoadBool,
    LoadNil,
    LoadNone,
    Move,

    // Arithmetic: generic (runtime tag checks + int/float promotion)
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Type-specialized: the compiler proved both operands
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    ModFloat,
    // 8-bit signed immediate in `c` (integer only)
    AddImm,
    SubImm,
    MulImm,
    DivImm,
    ModImm,
    Pow,
    Unm,
    Not,
    And,
    Or,

    // Comparisons storing a bool into `a`
    Cmp(CmpOp),
    CmpInt(CmpOp),
    CmpFloat(CmpOp),
    In,
    NotIn,

    // Arrays, strings, tables
    NewArray,
    GetIndex,
    GetIndexImm,
    GetIndexInt,
    SetIndex,
    SetIndexInt,
    Slice,
    ConcatArray,
    Len,
    NewTable,
    GetField,
    SetField,

    // Heap references
    NewRef,
    NewWeak,
    WeakToStrong,
    IncRef,
    DecRef,
    SetRef,
    Deref,
    CheckCycles,

    // Option / result
    WrapSome,
    WrapOk,
    WrapErr,
    UnwrapOption,
    UnwrapResult,
    TestTag,
    Cast,

    // Control flow
    Jmp,
    Test,
    TestSet,
    CmpJmp(CmpOp),
    CmpJmpInt(CmpOp),
    CmpJmpFloat(CmpOp),
    IncTest,
    ForPrep,
    ForLoop,
    ForIntPrep,
    ForIntLoop,

    // Calls
    Arg,
    ArgImm,
    Call,
    CallBuiltin,
    CallHost,
    CallFfi,
    /// Indirect call through a closure value; `func` names the register
    /// holding the closure, whose captures are prepended to the args
    CallClosure,
    /// Build a closure value from a function index plus captured values
    /// taken from the argument queue
    NewClosure,
    TailCall,
    Return,

    // Globals
    InitGlobal,
    GetGlobal,
    SetGlobal,

    // Defers
    PushDefer,
    ExecDefers,
    DeferEnd,

    // Coroutines
    Spawn,
    Resume,
    Yield,

    // Fused arithmetic: r[a] = r[a] OP2 (r[b] OP1 r[c])
    Fused(FusedOp),
    FusedInt(FusedOp),
    FusedFloat(FusedOp),
    // Global read-modify-write: g[k(b)] = g[k(b)] OP r[c]
    LoadAddStore,
    LoadSubStore,
    LoadMulStore,
    LoadDivStore,
    LoadModStore,
    // Field read-modify-write: r[a].k(b) = r[a].k(b) OP r[c]
    GetAddSet,
    GetSubSet,
    GetMulSet,
    GetDivSet,
    GetModSet,
}

impl Opcode {
    /// True for the compare-and-jump family (Ax format, offset in the
    /// upper 16 bits)
    pub fn is_cmp_jmp(self) -> bool {
        matches!(
            self,
            Opcode::CmpJmp(_) | Opcode::CmpJmpInt(_) | Opcode::CmpJmpFloat(_) | Opcode::IncTest
        )
    }

    /// True for instructions that transfer control via an `sbx` offset
    pub fn is_sbx_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jmp | Opcode::ForPrep | Opcode::ForLoop | Opcode::ForIntPrep | Opcode::ForIntLoop
        )
    }

    /// True when execution does not always fall through to pc+1
    pub fn is_control_flow(self) -> bool {
        self.is_cmp_jmp()
            || self.is_sbx_jump()
            || matches!(
                self,
                Opcode::Test
                    | Opcode::TestSet
                    | Opcode::TestTag
                    | Opcode::Return
                    | Opcode::TailCall
                    | Opcode::Yield
                    | Opcode::PushDefer
                    | Opcode::ExecDefers
                    | Opcode::DeferEnd
            )
    }

    /// True when the instruction has effects beyond writing its
    /// destination register (heap, globals, I/O, control, RC)
    pub fn has_side_effects(self) -> bool {
        self.is_control_flow()
            || matches!(
                self,
                Opcode::SetIndex
                    | Opcode::SetIndexInt
                    | Opcode::SetField
                    | Opcode::SetRef
                    | Opcode::NewRef
                    | Opcode::NewWeak
                    | Opcode::IncRef
                    | Opcode::DecRef
                    | Opcode::CheckCycles
                    | Opcode::Arg
                    | Opcode::ArgImm
                    | Opcode::Call
                    | Opcode::CallBuiltin
                    | Opcode::CallHost
                    | Opcode::CallFfi
                    | Opcode::Spawn
                    | Opcode::Resume
                    | Opcode::InitGlobal
                    | Opcode::SetGlobal
                    | Opcode::LoadAddStore
                    | Opcode::LoadSubStore
                    | Opcode::LoadMulStore
                    | Opcode::LoadDivStore
                    | Opcode::LoadModStore
                    | Opcode::GetAddSet
                    | Opcode::GetSubSet
                    | Opcode::GetMulSet
                    | Opcode::GetDivSet
                    | Opcode::GetModSet
            )
    }
}

/// Operand payloads - one of five formats
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operands {
    Abc { a: u8, b: u16, c: u16 },
    Abx { a: u8, bx: u32 },
    Asbx { a: u8, sbx: i32 },
    Ax { ax: u32 },
    Call { dst: u8, func: u32, argc: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub operands: Operands,
}

impl Instruction {
    pub fn abc(op: Opcode, a: u8, b: u16, c: u16) -> Self {
        Instruction {
            op,
            operands: Operands::Abc { a, b, c },
        }
    }

    pub fn abx(op: Opcode, a: u8, bx: u32) -> Self {
        Instruction {
            op,
            operands: Operands::Abx { a, bx },
        }
    }

    pub fn asbx(op: Opcode, a: u8, sbx: i32) -> Self {
        Instruction {
            op,
            operands: Operands::Asbx { a, sbx },
        }
    }

    pub fn call(op: Opcode, dst: u8, func: u32, argc: u8) -> Self {
        Instruction {
            op,
            operands: Operands::Call { dst, func, argc },
        }
    }

    /// Build a compare-and-jump: offset lives in the upper 16 bits of
    /// `ax`, left operand in bits 8..16, right operand in bits 0..8.
    pub fn cmp_jmp(op: Opcode, lhs: u8, rhs: u8, offset: i16) -> Self {
        debug_assert!(op.is_cmp_jmp());
        let ax = ((offset as u16 as u32) << 16) | ((lhs as u32) << 8) | rhs as u32;
        Instruction {
            op,
            operands: Operands::Ax { ax },
        }
    }

    pub fn nop() -> Self {
        Instruction {
            op: Opcode::NoOp,
            operands: Operands::Ax { ax: 0 },
        }
    }

    /// Destination register written by this instruction, if any
    pub fn dest(&self) -> Option<u8> {
        match self.op {
            // These write nothing, or `a` is a source/base operand
            Opcode::NoOp
            | Opcode::Jmp
            | Opcode::Return
            | Opcode::TailCall
            | Opcode::Arg
            | Opcode::ArgImm
            | Opcode::Yield
            | Opcode::SetIndex
            | Opcode::SetIndexInt
            | Opcode::SetField
            | Opcode::SetRef
            | Opcode::SetGlobal
            | Opcode::InitGlobal
            | Opcode::IncRef
            | Opcode::DecRef
            | Opcode::CheckCycles
            | Opcode::Test
            | Opcode::TestTag
            | Opcode::PushDefer
            | Opcode::ExecDefers
            | Opcode::DeferEnd
            | Opcode::CmpJmp(_)
            | Opcode::CmpJmpInt(_)
            | Opcode::CmpJmpFloat(_)
            | Opcode::IncTest
            | Opcode::LoadAddStore
            | Opcode::LoadSubStore
            | Opcode::LoadMulStore
            | Opcode::LoadDivStore
            | Opcode::LoadModStore
            | Opcode::GetAddSet
            | Opcode::GetSubSet
            | Opcode::GetMulSet
            | Opcode::GetDivSet
            | Opcode::GetModSet => None,
            _ => match self.operands {
                Operands::Abc { a, .. } => Some(a),
                Operands::Abx { a, .. } => Some(a),
                Operands::Asbx { a, .. } => Some(a),
                Operands::Ax { .. } => None,
                Operands::Call { dst, .. } => Some(dst),
            },
        }
    }

    /// Unpack a compare-and-jump into (lhs, rhs, offset)
    pub fn unpack_cmp(&self) -> (u8, u8, i16) {
        match self.operands {
            Operands::Ax { ax } => {
                let offset = (ax >> 16) as u16 as i16;
                let lhs = ((ax >> 8) & 0xff) as u8;
                let rhs = (ax & 0xff) as u8;
                (lhs, rhs, offset)
            }
            _ => (0, 0, 0),
        }
    }

    /// Rewrite the jump offset of a compare-and-jump in place
    pub fn repack_cmp_offset(&mut self, offset: i16) {
        if let Operands::Ax { ax } = self.operands {
            let ax = (ax & 0x0000_ffff) | ((offset as u16 as u32) << 16);
            self.operands = Operands::Ax { ax };
        }
    }

    /// The signed immediate of the `*Imm` arithmetic forms
    pub fn imm8(&self) -> i8 {
        match self.operands {
            Operands::Abc { c, .. } => c as u8 as i8,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.operands {
            Operands::Abc { a, b, c } => write!(f, "{:?} {} {} {}", self.op, a, b, c),
            Operands::Abx { a, bx } => write!(f, "{:?} {} {}", self.op, a, bx),
            Operands::Asbx { a, sbx } => write!(f, "{:?} {} {:+}", self.op, a, sbx),
            Operands::Ax { .. } if self.op.is_cmp_jmp() => {
                let (lhs, rhs, offset) = self.unpack_cmp();
                write!(f, "{:?} {} {} {:+}", self.op, lhs, rhs, offset)
            }
            Operands::Ax { ax } => write!(f, "{:?} {}", self.op, ax),
            Operands::Call { dst, func, argc } => {
                write!(f, "{:?} {} f{} n{}", self.op, dst, func, argc)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_jmp_pack_roundtrip() {
        let instr = Instruction::cmp_jmp(Opcode::CmpJmp(CmpOp::Lt), 3, 7, -42);
        assert_eq!(instr.unpack_cmp(), (3, 7, -42));
    }

    #[test]
    fn test_cmp_jmp_offset_repair() {
        let mut instr = Instruction::cmp_jmp(Opcode::CmpJmpInt(CmpOp::Ge), 1, 2, 100);
        instr.repack_cmp_offset(-5);
        assert_eq!(instr.unpack_cmp(), (1, 2, -5));
    }

    #[test]
    fn test_negated_round_trips() {
        for op in [CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge] {
            assert_eq!(op.negated().negated(), op);
            assert_eq!(op.swapped().swapped(), op);
        }
    }

    #[test]
    fn test_dest_of_stores_is_none() {
        let set = Instruction::abc(Opcode::SetField, 0, 1, 2);
        assert_eq!(set.dest(), None);
        let load = Instruction::abx(Opcode::LoadK, 4, 0);
        assert_eq!(load.dest(), Some(4));
    }

    #[test]
    fn test_imm8_sign_extends() {
        let instr = Instruction::abc(Opcode::AddImm, 0, 1, (-3i8) as u8 as u16);
        assert_eq!(instr.imm8(), -3);
    }
}
