//! The opcode matrix.
//!
//! One table maps a symbolic opcode and a target version to its encoding:
//! operand-count class, opcode number, and whether the instruction takes
//! a store byte and/or a branch operand. The code generator never
//! hard-codes opcode bytes; everything goes through [`Op::info`].
//!
//! Opcode numbers and availability follow the Z-Machine Standards
//! Document 1.1, section 14.

use crate::version::ZVersion;

/// Operand-count class. Together with the operand types this determines
/// the instruction form (long/short/variable/extended) chosen at
/// emission time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// 2OP: long form, or variable form when the operands demand it.
    Two,
    /// 1OP: short form.
    One,
    /// 0OP: short form.
    Zero,
    /// VAR: always variable form.
    Var,
    /// VAR with up to 8 operands and a double type word (call_vs2/vn2).
    VarLong,
    /// EXT: 0xBE prefix, V5+.
    Ext,
}

/// Everything emission needs to know about one opcode on one version.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub class: OpClass,
    pub number: u8,
    pub store: bool,
    pub branch: bool,
}

impl OpcodeInfo {
    const fn new(class: OpClass, number: u8) -> Self {
        OpcodeInfo { class, number, store: false, branch: false }
    }
    const fn two(n: u8) -> Self {
        Self::new(OpClass::Two, n)
    }
    const fn one(n: u8) -> Self {
        Self::new(OpClass::One, n)
    }
    const fn zero(n: u8) -> Self {
        Self::new(OpClass::Zero, n)
    }
    const fn var(n: u8) -> Self {
        Self::new(OpClass::Var, n)
    }
    const fn var_long(n: u8) -> Self {
        Self::new(OpClass::VarLong, n)
    }
    const fn ext(n: u8) -> Self {
        Self::new(OpClass::Ext, n)
    }
    const fn store(mut self) -> Self {
        self.store = true;
        self
    }
    const fn branch(mut self) -> Self {
        self.branch = true;
        self
    }
}

/// Symbolic opcodes. Naming follows the standard's assembly mnemonics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    // 2OP
    Je,
    Jl,
    Jg,
    DecChk,
    IncChk,
    Jin,
    Test,
    Or,
    And,
    TestAttr,
    SetAttr,
    ClearAttr,
    Store,
    InsertObj,
    Loadw,
    Loadb,
    GetProp,
    GetPropAddr,
    GetNextProp,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Call2s,
    Call2n,
    SetColour,
    Throw,
    // 1OP
    Jz,
    GetSibling,
    GetChild,
    GetParent,
    GetPropLen,
    Inc,
    Dec,
    PrintAddr,
    Call1s,
    RemoveObj,
    PrintObj,
    Ret,
    Jump,
    PrintPaddr,
    Load,
    Not,
    Call1n,
    // 0OP
    Rtrue,
    Rfalse,
    Print,
    PrintRet,
    Nop,
    Save,
    Restore,
    Restart,
    RetPopped,
    Pop,
    Catch,
    Quit,
    NewLine,
    ShowStatus,
    Verify,
    Piracy,
    // VAR
    CallVs,
    Storew,
    Storeb,
    PutProp,
    Sread,
    PrintChar,
    PrintNum,
    Random,
    Push,
    Pull,
    SplitWindow,
    SetWindow,
    CallVs2,
    EraseWindow,
    EraseLine,
    SetCursor,
    GetCursor,
    SetTextStyle,
    BufferMode,
    OutputStream,
    InputStream,
    SoundEffect,
    ReadChar,
    ScanTable,
    CallVn,
    CallVn2,
    Tokenise,
    EncodeText,
    CopyTable,
    PrintTable,
    CheckArgCount,
    // EXT
    SaveExt,
    RestoreExt,
    LogShift,
    ArtShift,
    SetFont,
    DrawPicture,
    PictureData,
    ErasePicture,
    SaveUndo,
    RestoreUndo,
    PrintUnicode,
    CheckUnicode,
    MouseWindow,
    ReadMouse,
}

impl Op {
    /// Look up the encoding of `self` on `v`, or `None` when the opcode
    /// does not exist there.
    pub fn info(self, v: ZVersion) -> Option<OpcodeInfo> {
        use OpcodeInfo as I;
        use ZVersion::*;
        let i = match self {
            Op::Je => I::two(1).branch(),
            Op::Jl => I::two(2).branch(),
            Op::Jg => I::two(3).branch(),
            Op::DecChk => I::two(4).branch(),
            Op::IncChk => I::two(5).branch(),
            Op::Jin => I::two(6).branch(),
            Op::Test => I::two(7).branch(),
            Op::Or => I::two(8).store(),
            Op::And => I::two(9).store(),
            Op::TestAttr => I::two(10).branch(),
            Op::SetAttr => I::two(11),
            Op::ClearAttr => I::two(12),
            Op::Store => I::two(13),
            Op::InsertObj => I::two(14),
            Op::Loadw => I::two(15).store(),
            Op::Loadb => I::two(16).store(),
            Op::GetProp => I::two(17).store(),
            Op::GetPropAddr => I::two(18).store(),
            Op::GetNextProp => I::two(19).store(),
            Op::Add => I::two(20).store(),
            Op::Sub => I::two(21).store(),
            Op::Mul => I::two(22).store(),
            Op::Div => I::two(23).store(),
            Op::Mod => I::two(24).store(),
            Op::Call2s if v >= V4 => I::two(25).store(),
            Op::Call2n if v >= V5 => I::two(26),
            Op::SetColour if v >= V5 => I::two(27),
            Op::Throw if v >= V5 => I::two(28),

            Op::Jz => I::one(0).branch(),
            Op::GetSibling => I::one(1).store().branch(),
            Op::GetChild => I::one(2).store().branch(),
            Op::GetParent => I::one(3).store(),
            Op::GetPropLen => I::one(4).store(),
            Op::Inc => I::one(5),
            Op::Dec => I::one(6),
            Op::PrintAddr => I::one(7),
            Op::Call1s if v >= V4 => I::one(8).store(),
            Op::RemoveObj => I::one(9),
            Op::PrintObj => I::one(10),
            Op::Ret => I::one(11),
            Op::Jump => I::one(12),
            Op::PrintPaddr => I::one(13),
            Op::Load => I::one(14).store(),
            Op::Not if v <= V4 => I::one(15).store(),
            Op::Not => I::var(24).store(),
            Op::Call1n if v >= V5 => I::one(15),

            Op::Rtrue => I::zero(0),
            Op::Rfalse => I::zero(1),
            Op::Print => I::zero(2),
            Op::PrintRet => I::zero(3),
            Op::Nop => I::zero(4),
            Op::Save if v == V3 => I::zero(5).branch(),
            Op::Save if v == V4 => I::zero(5).store(),
            Op::Save => I::ext(0).store(),
            Op::Restore if v == V3 => I::zero(6).branch(),
            Op::Restore if v == V4 => I::zero(6).store(),
            Op::Restore => I::ext(1).store(),
            Op::SaveExt if v >= V5 => I::ext(0).store(),
            Op::RestoreExt if v >= V5 => I::ext(1).store(),
            Op::Restart => I::zero(7),
            Op::RetPopped => I::zero(8),
            Op::Pop if v <= V4 => I::zero(9),
            Op::Catch if v >= V5 => I::zero(9).store(),
            Op::Quit => I::zero(10),
            Op::NewLine => I::zero(11),
            Op::ShowStatus if v == V3 => I::zero(12),
            Op::Verify => I::zero(13).branch(),
            Op::Piracy if v >= V5 => I::zero(15).branch(),

            Op::CallVs => I::var(0).store(),
            Op::Storew => I::var(1),
            Op::Storeb => I::var(2),
            Op::PutProp => I::var(3),
            Op::Sread if v <= V4 => I::var(4),
            Op::Sread => I::var(4).store(),
            Op::PrintChar => I::var(5),
            Op::PrintNum => I::var(6),
            Op::Random => I::var(7).store(),
            Op::Push => I::var(8),
            Op::Pull if v == V6 => I::var(9).store(),
            Op::Pull => I::var(9),
            Op::SplitWindow => I::var(10),
            Op::SetWindow => I::var(11),
            Op::CallVs2 if v >= V4 => I::var_long(12).store(),
            Op::EraseWindow if v >= V4 => I::var(13),
            Op::EraseLine if v >= V4 => I::var(14),
            Op::SetCursor if v >= V4 => I::var(15),
            Op::GetCursor if v >= V4 => I::var(16),
            Op::SetTextStyle if v >= V4 => I::var(17),
            Op::BufferMode if v >= V4 => I::var(18),
            Op::OutputStream => I::var(19),
            Op::InputStream => I::var(20),
            Op::SoundEffect => I::var(21),
            Op::ReadChar if v >= V4 => I::var(22).store(),
            Op::ScanTable if v >= V4 => I::var(23).store().branch(),
            Op::CallVn if v >= V5 => I::var(25),
            Op::CallVn2 if v >= V5 => I::var_long(26),
            Op::Tokenise if v >= V5 => I::var(27),
            Op::EncodeText if v >= V5 => I::var(28),
            Op::CopyTable if v >= V5 => I::var(29),
            Op::PrintTable if v >= V5 => I::var(30),
            Op::CheckArgCount if v >= V5 => I::var(31).branch(),

            Op::LogShift if v >= V5 => I::ext(2).store(),
            Op::ArtShift if v >= V5 => I::ext(3).store(),
            Op::SetFont if v >= V5 => I::ext(4).store(),
            Op::DrawPicture if v == V6 => I::ext(5),
            Op::PictureData if v == V6 => I::ext(6).branch(),
            Op::ErasePicture if v == V6 => I::ext(7),
            Op::SaveUndo if v >= V5 => I::ext(9).store(),
            Op::RestoreUndo if v >= V5 => I::ext(10).store(),
            Op::PrintUnicode if v >= V5 => I::ext(11),
            Op::CheckUnicode if v >= V5 => I::ext(12).store(),
            Op::MouseWindow if v == V6 => I::ext(23),
            Op::ReadMouse if v == V6 => I::ext(22),

            _ => return None,
        };
        debug_assert!(!matches!(i.class, OpClass::Ext) || v.has_extended_opcodes());
        Some(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ZVersion::*;

    #[test]
    fn availability_tracks_versions() {
        assert!(Op::Call2s.info(V3).is_none());
        assert!(Op::Call2s.info(V4).is_some());
        assert!(Op::LogShift.info(V4).is_none());
        assert_eq!(Op::LogShift.info(V5).unwrap().class, OpClass::Ext);
        assert!(Op::ShowStatus.info(V4).is_none());
    }

    #[test]
    fn not_migrates_to_var_in_v5() {
        let v4 = Op::Not.info(V4).unwrap();
        assert_eq!((v4.class, v4.number), (OpClass::One, 15));
        let v5 = Op::Not.info(V5).unwrap();
        assert_eq!((v5.class, v5.number), (OpClass::Var, 24));
        // 1OP:15 is call_1n from V5 on.
        let c = Op::Call1n.info(V5).unwrap();
        assert_eq!((c.class, c.number), (OpClass::One, 15));
    }

    #[test]
    fn save_moves_to_ext() {
        assert!(Op::Save.info(V3).unwrap().branch);
        assert!(Op::Save.info(V4).unwrap().store);
        assert_eq!(Op::Save.info(V5).unwrap().class, OpClass::Ext);
    }

    #[test]
    fn read_becomes_store_in_v5() {
        assert!(!Op::Sread.info(V3).unwrap().store);
        assert!(Op::Sread.info(V5).unwrap().store);
    }
}
