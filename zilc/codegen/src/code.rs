//! Instruction encoding and label resolution for one routine.
//!
//! A [`CodeBuilder`] accumulates the bytecode of a single routine. It
//! picks the most compact legal instruction form for each emission,
//! manages branch operands, and resolves labels in a single forward
//! pass. Conditional branches to labels always reserve the long (2-byte)
//! branch form: short-form offsets are unsigned and forward distances
//! are unknown at emission time, so the long form is the only shape that
//! never needs re-emission. Branches that return true/false use the
//! 1-byte short form with the special offsets 1 and 0.
//!
//! Errors here are plain strings; the caller owns source locations.

use cranelift_entity::{entity_impl, PrimaryMap};
use log::trace;
use smallvec::SmallVec;

use zilc_zmachine::opcodes::{Op, OpClass};
use zilc_zmachine::ZVersion;

use crate::fixup::{Fixup, RefKind, Region};

/// A branch or jump target within the routine being built.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Label(u32);
entity_impl!(Label, "label");

/// One instruction operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Large(u16),
    Small(u8),
    /// Variable by number: 0 = stack, 1-15 locals, 16-255 globals.
    Variable(u8),
    /// A forward reference: a large constant holding a placeholder,
    /// recorded for fixup.
    Ref(RefKind, u32),
}

impl Operand {
    /// The most compact constant operand for `n`.
    pub fn constant(n: i32) -> Operand {
        if (0..=255).contains(&n) {
            Operand::Small(n as u8)
        } else {
            Operand::Large(n as u16)
        }
    }

    fn type_code(self) -> u8 {
        match self {
            Operand::Large(_) | Operand::Ref(..) => 0b00,
            Operand::Small(_) => 0b01,
            Operand::Variable(_) => 0b10,
        }
    }

    fn is_byte(self) -> bool {
        matches!(self, Operand::Small(_) | Operand::Variable(_))
    }
}

/// Where a conditional branch goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BranchTarget {
    Label(Label),
    /// Special offset 0.
    ReturnFalse,
    /// Special offset 1.
    ReturnTrue,
}

#[derive(Copy, Clone, PartialEq)]
enum PendingKind {
    /// A 2-byte long-form branch operand (polarity in the high bit).
    Branch { polarity: bool },
    /// The 2-byte signed operand of a `jump` instruction.
    Jump,
}

struct Pending {
    at: u32,
    label: Label,
    kind: PendingKind,
}

pub struct CodeBuilder {
    version: ZVersion,
    bytes: Vec<u8>,
    labels: PrimaryMap<Label, Option<u32>>,
    pending: Vec<Pending>,
    fixups: Vec<Fixup>,
    /// Whether the last emitted instruction unconditionally left.
    terminated: bool,
}

impl CodeBuilder {
    pub fn new(version: ZVersion) -> Self {
        CodeBuilder {
            version,
            bytes: Vec::new(),
            labels: PrimaryMap::new(),
            pending: Vec::new(),
            fixups: Vec::new(),
            terminated: false,
        }
    }

    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None)
    }

    /// Bind `label` to the current offset and patch waiting branches.
    pub fn bind_label(&mut self, label: Label) -> Result<(), String> {
        debug_assert!(self.labels[label].is_none(), "label bound twice");
        let target = self.offset();
        self.labels[label] = Some(target);
        self.terminated = false;
        let mut patches: SmallVec<[(u32, PendingKind); 8]> = SmallVec::new();
        self.pending.retain(|p| {
            if p.label == label {
                patches.push((p.at, p.kind));
                false
            } else {
                true
            }
        });
        for (at, kind) in patches {
            self.patch(at, target, kind)?;
        }
        Ok(())
    }

    fn patch(&mut self, at: u32, target: u32, kind: PendingKind) -> Result<(), String> {
        // One formula for both shapes: offset = target − pc_after + 2.
        let offset = i64::from(target) - (i64::from(at) + 2) + 2;
        match kind {
            PendingKind::Branch { polarity } => {
                if !(-8192..=8191).contains(&offset) {
                    return Err(format!("branch distance {offset} not representable"));
                }
                if (0..=1).contains(&offset) {
                    // Would collide with the return-false/true encodings.
                    return Err("branch to an adjacent label".into());
                }
                let off = (offset as u16) & 0x3FFF;
                self.bytes[at as usize] = ((polarity as u8) << 7) | (off >> 8) as u8;
                self.bytes[at as usize + 1] = off as u8;
            }
            PendingKind::Jump => {
                if !(-32768..=32767).contains(&offset) {
                    return Err(format!("jump distance {offset} not representable"));
                }
                let off = offset as i16 as u16;
                self.bytes[at as usize] = (off >> 8) as u8;
                self.bytes[at as usize + 1] = off as u8;
            }
        }
        Ok(())
    }

    /// All labels must be bound by the end of the routine.
    pub fn finish(mut self) -> Result<CodeBlob, String> {
        if !self.pending.is_empty() {
            return Err("branch to an unbound label".into());
        }
        self.pending.shrink_to_fit();
        Ok(CodeBlob { bytes: self.bytes, fixups: self.fixups })
    }

    fn push_byte(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn push_word(&mut self, w: u16) {
        self.bytes.push((w >> 8) as u8);
        self.bytes.push(w as u8);
    }

    fn push_operand(&mut self, op: Operand) {
        match op {
            Operand::Large(w) => self.push_word(w),
            Operand::Small(b) | Operand::Variable(b) => self.push_byte(b),
            Operand::Ref(kind, index) => {
                self.fixups.push(Fixup {
                    region: Region::Code,
                    offset: self.offset(),
                    kind,
                    index,
                });
                self.push_word(kind.placeholder(index));
            }
        }
    }

    fn push_type_bytes(&mut self, operands: &[Operand], count: usize) {
        let mut types = 0u16;
        for i in 0..count {
            let code = operands.get(i).map_or(0b11, |o| o.type_code());
            types = (types << 2) | u16::from(code);
        }
        if count == 8 {
            self.push_word(types);
        } else {
            self.push_byte(types as u8);
        }
    }

    /// Emit one instruction. The caller must supply a store variable
    /// exactly when the opcode stores, and a branch exactly when it
    /// branches; those are checked here.
    pub fn emit(
        &mut self,
        op: Op,
        operands: &[Operand],
        store: Option<u8>,
        branch: Option<(bool, BranchTarget)>,
    ) -> Result<(), String> {
        let info = op
            .info(self.version)
            .ok_or_else(|| format!("{op:?} is not available on {}", self.version))?;
        debug_assert_eq!(info.store, store.is_some(), "store byte mismatch for {op:?}");
        debug_assert_eq!(info.branch, branch.is_some(), "branch mismatch for {op:?}");
        trace!("emit {op:?} {operands:?} at {:#x}", self.offset());

        match info.class {
            OpClass::Two => {
                let long_ok = operands.len() == 2 && operands.iter().all(|o| o.is_byte());
                if long_ok {
                    let t1 = matches!(operands[0], Operand::Variable(_)) as u8;
                    let t2 = matches!(operands[1], Operand::Variable(_)) as u8;
                    self.push_byte((t1 << 6) | (t2 << 5) | info.number);
                    self.push_operand(operands[0]);
                    self.push_operand(operands[1]);
                } else {
                    // 2OP in variable form; je alone may take up to 4.
                    let max = if op == Op::Je { 4 } else { 2 };
                    if operands.len() > max || operands.is_empty() {
                        return Err(format!("{op:?} takes 1..={max} operands"));
                    }
                    self.push_byte(0xC0 | info.number);
                    self.push_type_bytes(operands, 4);
                    for &o in operands {
                        self.push_operand(o);
                    }
                }
            }
            OpClass::One => {
                let [operand] = operands else {
                    return Err(format!("{op:?} takes exactly one operand"));
                };
                self.push_byte(0x80 | (operand.type_code() << 4) | info.number);
                self.push_operand(*operand);
            }
            OpClass::Zero => {
                if !operands.is_empty() {
                    return Err(format!("{op:?} takes no operands"));
                }
                self.push_byte(0xB0 | info.number);
            }
            OpClass::Var => {
                if operands.len() > 4 {
                    return Err(format!("{op:?} takes at most 4 operands"));
                }
                self.push_byte(0xE0 | info.number);
                self.push_type_bytes(operands, 4);
                for &o in operands {
                    self.push_operand(o);
                }
            }
            OpClass::VarLong => {
                if operands.len() > 8 {
                    return Err(format!("{op:?} takes at most 8 operands"));
                }
                self.push_byte(0xE0 | info.number);
                self.push_type_bytes(operands, 8);
                for &o in operands {
                    self.push_operand(o);
                }
            }
            OpClass::Ext => {
                if operands.len() > 4 {
                    return Err(format!("{op:?} takes at most 4 operands"));
                }
                self.push_byte(0xBE);
                self.push_byte(info.number);
                self.push_type_bytes(operands, 4);
                for &o in operands {
                    self.push_operand(o);
                }
            }
        }

        if let Some(var) = store {
            self.push_byte(var);
        }
        if let Some((polarity, target)) = branch {
            match target {
                BranchTarget::ReturnFalse => {
                    self.push_byte(((polarity as u8) << 7) | 0x40);
                }
                BranchTarget::ReturnTrue => {
                    self.push_byte(((polarity as u8) << 7) | 0x40 | 1);
                }
                BranchTarget::Label(label) => {
                    let at = self.offset();
                    if let Some(target) = self.labels[label] {
                        self.push_word(0);
                        self.patch(at, target, PendingKind::Branch { polarity })?;
                    } else {
                        self.pending.push(Pending {
                            at,
                            label,
                            kind: PendingKind::Branch { polarity },
                        });
                        self.push_word(0);
                    }
                }
            }
        }

        self.terminated = matches!(
            op,
            Op::Rtrue
                | Op::Rfalse
                | Op::Ret
                | Op::RetPopped
                | Op::PrintRet
                | Op::Quit
                | Op::Restart
                | Op::Throw
                | Op::Jump
        );
        Ok(())
    }

    /// An unconditional `jump` to a label.
    pub fn emit_jump(&mut self, label: Label) -> Result<(), String> {
        let info = Op::Jump.info(self.version).unwrap();
        self.push_byte(0x80 | info.number); // large-constant short form
        let at = self.offset();
        if let Some(target) = self.labels[label] {
            self.push_word(0);
            self.patch(at, target, PendingKind::Jump)?;
        } else {
            self.pending.push(Pending { at, label, kind: PendingKind::Jump });
            self.push_word(0);
        }
        self.terminated = true;
        Ok(())
    }
}

/// The finished bytecode of one routine, with code-relative fixups.
pub struct CodeBlob {
    pub bytes: Vec<u8>,
    pub fixups: Vec<Fixup>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ZVersion::V3;

    fn builder() -> CodeBuilder {
        CodeBuilder::new(V3)
    }

    #[test]
    fn long_form_two_op() {
        let mut b = builder();
        // add small, variable -> store stack
        b.emit(Op::Add, &[Operand::Small(5), Operand::Variable(1)], Some(0), None)
            .unwrap();
        // 0b0_01_1_10100 = opcode 20, t1 small (bit6=0), t2 var (bit5=1)
        assert_eq!(b.bytes, vec![0x34, 0x05, 0x01, 0x00]);
    }

    #[test]
    fn two_op_with_large_operand_goes_variable() {
        let mut b = builder();
        b.emit(Op::Add, &[Operand::Large(1000), Operand::Small(1)], Some(0), None)
            .unwrap();
        // 0xC0|20 = 0xD4, types 00 01 11 11 = 0x7F... big-endian: 0b00_01_11_11
        assert_eq!(b.bytes[0], 0xD4);
        assert_eq!(b.bytes[1], 0b0001_1111);
        assert_eq!(&b.bytes[2..4], &[0x03, 0xE8]);
    }

    #[test]
    fn je_with_three_operands() {
        let mut b = builder();
        b.emit(
            Op::Je,
            &[Operand::Variable(1), Operand::Small(2), Operand::Small(3)],
            None,
            Some((true, BranchTarget::ReturnTrue)),
        )
        .unwrap();
        // 2OP-as-VAR: 0xC0|1 = 0xC1, types 10 01 01 11
        assert_eq!(b.bytes[0], 0xC1);
        assert_eq!(b.bytes[1], 0b1001_0111);
        assert_eq!(&b.bytes[2..5], &[1, 2, 3]);
        // short-form branch, polarity 1, offset 1 = return true
        assert_eq!(b.bytes[5], 0xC1);
    }

    #[test]
    fn zero_op_and_one_op() {
        let mut b = builder();
        b.emit(Op::Quit, &[], None, None).unwrap();
        assert_eq!(b.bytes, vec![0xBA]);
        let mut b = builder();
        b.emit(Op::PrintPaddr, &[Operand::Large(0x1234)], None, None).unwrap();
        assert_eq!(b.bytes, vec![0x8D, 0x12, 0x34]);
    }

    #[test]
    fn var_form_call() {
        let mut b = builder();
        b.emit(
            Op::CallVs,
            &[Operand::Large(0x2222), Operand::Small(7)],
            Some(0),
            None,
        )
        .unwrap();
        assert_eq!(b.bytes[0], 0xE0);
        assert_eq!(b.bytes[1], 0b0001_1111);
        assert_eq!(&b.bytes[2..5], &[0x22, 0x22, 0x07]);
        assert_eq!(b.bytes[5], 0x00);
    }

    #[test]
    fn forward_branch_resolves_on_bind() {
        let mut b = builder();
        let l = b.new_label();
        b.emit(Op::Jz, &[Operand::Variable(1)], None, Some((false, BranchTarget::Label(l))))
            .unwrap();
        b.emit(Op::Rtrue, &[], None, None).unwrap();
        b.bind_label(l).unwrap();
        b.emit(Op::Rfalse, &[], None, None).unwrap();
        let blob = b.finish().unwrap();
        // jz var(1): 0xA0|0 with var type -> 0xA0; then branch operand.
        assert_eq!(blob.bytes[0], 0xA0);
        assert_eq!(blob.bytes[1], 0x01);
        // branch bytes at 2..4, target offset 5, pc_after = 4:
        // offset = 5 - 4 + 2 = 3; polarity 0 long form.
        assert_eq!(blob.bytes[2], 0x00);
        assert_eq!(blob.bytes[3], 0x03);
        assert_eq!(blob.bytes[4], 0xB0); // rtrue
        assert_eq!(blob.bytes[5], 0xB1); // rfalse
    }

    #[test]
    fn backward_jump_offset() {
        let mut b = builder();
        let top = b.new_label();
        b.bind_label(top).unwrap();
        b.emit(Op::NewLine, &[], None, None).unwrap();
        b.emit_jump(top).unwrap();
        let blob = b.finish().unwrap();
        // jump at offset 1, operand at 2..4, pc_after = 4.
        // offset = 0 - 4 + 2 = -2 = 0xFFFE.
        assert_eq!(blob.bytes[1], 0x8C);
        assert_eq!(&blob.bytes[2..4], &[0xFF, 0xFE]);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut b = builder();
        let l = b.new_label();
        b.emit(Op::Jz, &[Operand::Small(0)], None, Some((true, BranchTarget::Label(l))))
            .unwrap();
        assert!(b.finish().is_err());
    }

    #[test]
    fn ref_operands_record_fixups() {
        let mut b = builder();
        b.emit(Op::CallVs, &[Operand::Ref(RefKind::Routine, 3)], Some(0), None)
            .unwrap();
        let blob = b.finish().unwrap();
        assert_eq!(blob.fixups.len(), 1);
        assert_eq!(blob.fixups[0].kind, RefKind::Routine);
        assert_eq!(blob.fixups[0].offset, 2);
        // The sentinel value is in the bytes.
        assert_eq!(&blob.bytes[2..4], &[0x40, 0x03]);
    }

    #[test]
    fn ext_requires_v5() {
        let mut b = CodeBuilder::new(ZVersion::V5);
        b.emit(Op::LogShift, &[Operand::Small(1), Operand::Small(2)], Some(0), None)
            .unwrap();
        assert_eq!(b.bytes[0], 0xBE);
        assert_eq!(b.bytes[1], 2);
        assert!(CodeBuilder::new(V3)
            .emit(Op::LogShift, &[], Some(0), None)
            .is_err());
    }
}
