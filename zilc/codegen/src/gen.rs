//! Lowering ZIL expressions to Z-machine bytecode.
//!
//! One [`RoutineGen`] per routine. Expressions are generated against a
//! destination (discard, stack push, or a specific variable); predicates
//! are generated against a branch target and wanted truth, so `COND`,
//! `AND`/`OR` and the comparison forms never materialize booleans unless
//! a value is actually demanded.

use log::trace;
use smallvec::SmallVec;

use zilc_frontend::decl::{ParamKind, RoutineDef};
use zilc_frontend::error::Location;
use zilc_frontend::value::Value;
use zilc_zmachine::opcodes::Op;
use zilc_zmachine::version::MAX_LOCALS;
use zilc_zmachine::ZVersion;

use crate::code::{BranchTarget, CodeBlob, CodeBuilder, Label, Operand};
use crate::fixup::{Imm, ImmResolver, RefKind};
use crate::resolve::Resolver;
use crate::result::{CompileError, CompileResult, Diagnostics};
use crate::symbols::Sym;

/// Where an expression's value goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Dest {
    Discard,
    Push,
    Var(u8),
}

impl Dest {
    fn store_byte(self) -> u8 {
        match self {
            Dest::Discard | Dest::Push => 0,
            Dest::Var(v) => v,
        }
    }
}

/// Branch destination for predicate lowering.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CondTarget {
    Label(Label),
    ReturnTrue,
    ReturnFalse,
}

impl CondTarget {
    fn branch(self) -> BranchTarget {
        match self {
            CondTarget::Label(l) => BranchTarget::Label(l),
            CondTarget::ReturnTrue => BranchTarget::ReturnTrue,
            CondTarget::ReturnFalse => BranchTarget::ReturnFalse,
        }
    }
}

struct LoopCx {
    name: Option<zilc_frontend::intern::Atom>,
    start: Label,
    end: Label,
    dest: Dest,
}

/// A finished routine, ready for layout.
pub struct GennedRoutine {
    pub name: zilc_frontend::intern::Atom,
    /// Initial local values for the V1-4 header, one per local.
    pub locals: Vec<u16>,
    pub code: CodeBlob,
    pub loc: Location,
}

pub struct RoutineGen<'a, 'r> {
    version: ZVersion,
    resolver: &'a mut Resolver<'r>,
    diag: &'a mut Diagnostics,
    cb: CodeBuilder,
    /// Active name -> slot bindings; truncated on scope exit.
    locals: Vec<(zilc_frontend::intern::Atom, u8)>,
    /// Next free slot; restored on scope exit.
    next_slot: u8,
    /// Highest slot ever used = the routine's local count.
    high_water: u8,
    local_inits: Vec<u16>,
    loops: Vec<LoopCx>,
    loc: Location,
    is_go: bool,
}

pub fn gen_routine<'r>(
    def: &RoutineDef,
    is_go: bool,
    resolver: &mut Resolver<'r>,
    diag: &mut Diagnostics,
) -> CompileResult<GennedRoutine> {
    let version = resolver.world.version;
    let mut g = RoutineGen {
        version,
        resolver,
        diag,
        cb: CodeBuilder::new(version),
        locals: Vec::new(),
        next_slot: 1,
        high_water: 0,
        local_inits: vec![0; MAX_LOCALS],
        loops: Vec::new(),
        loc: def.loc.clone(),
        is_go,
    };
    g.run(def)
}

impl<'a, 'r> RoutineGen<'a, 'r> {
    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::Codegen { loc: self.loc.clone(), message: message.into() }
    }

    fn name(&self, a: zilc_frontend::intern::Atom) -> &str {
        self.resolver.interner.name(a)
    }

    fn emit(
        &mut self,
        op: Op,
        operands: &[Operand],
        store: Option<u8>,
        branch: Option<(bool, BranchTarget)>,
    ) -> CompileResult<()> {
        self.cb
            .emit(op, operands, store, branch)
            .map_err(|m| CompileError::Codegen { loc: self.loc.clone(), message: m })
    }

    fn bind(&mut self, label: Label) -> CompileResult<()> {
        self.cb
            .bind_label(label)
            .map_err(|m| CompileError::Codegen { loc: self.loc.clone(), message: m })
    }

    fn jump(&mut self, label: Label) -> CompileResult<()> {
        self.cb
            .emit_jump(label)
            .map_err(|m| CompileError::Codegen { loc: self.loc.clone(), message: m })
    }

    fn alloc_local(&mut self, atom: zilc_frontend::intern::Atom) -> CompileResult<u8> {
        if usize::from(self.next_slot) > MAX_LOCALS {
            return Err(self.err(format!(
                "routine needs more than {MAX_LOCALS} locals"
            )));
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.high_water = self.high_water.max(slot);
        self.locals.push((atom, slot));
        Ok(slot)
    }

    fn scratch_local(&mut self) -> CompileResult<u8> {
        let tmp = self.resolver.interner.intern("%SCRATCH%");
        self.alloc_local(tmp)
    }

    fn local_of(&self, atom: zilc_frontend::intern::Atom) -> Option<u8> {
        self.locals.iter().rev().find(|&&(a, _)| a == atom).map(|&(_, s)| s)
    }

    fn enter_scope(&self) -> (usize, u8) {
        (self.locals.len(), self.next_slot)
    }

    fn exit_scope(&mut self, mark: (usize, u8)) {
        self.locals.truncate(mark.0);
        self.next_slot = mark.1;
    }

    fn run(mut self, def: &RoutineDef) -> CompileResult<GennedRoutine> {
        trace!("generating routine {}", self.name(def.name));
        if def.required_count() + def.optional_count() > self.version.max_call_args() {
            return Err(self.err(format!(
                "{} takes more than {} parameters on {}",
                self.name(def.name),
                self.version.max_call_args(),
                self.version
            )));
        }

        // Parameters and auxiliaries claim the first slots.
        for param in &def.params {
            let slot = self.alloc_local(param.name)?;
            if let Some(default) = &param.default {
                self.gen_param_default(param.kind.clone(), slot, default, def)?;
            }
        }

        // Body: every statement but the last for effect.
        let (last, init) = def.body.split_last().expect("parser enforces a body");
        for stmt in init {
            self.gen_expr(stmt, Dest::Discard)?;
        }

        if self.is_go {
            self.gen_expr(last, Dest::Discard)?;
            if !self.cb.terminated() {
                self.emit(Op::Quit, &[], None, None)?;
            }
        } else if let Some(operand) = self.leaf_operand(last)? {
            match operand {
                Operand::Small(1) => self.emit(Op::Rtrue, &[], None, None)?,
                Operand::Small(0) => self.emit(Op::Rfalse, &[], None, None)?,
                o => self.emit(Op::Ret, &[o], None, None)?,
            }
        } else {
            self.gen_expr(last, Dest::Push)?;
            if !self.cb.terminated() {
                self.emit(Op::RetPopped, &[], None, None)?;
            }
        }

        let code = self
            .cb
            .finish()
            .map_err(|m| CompileError::Codegen { loc: def.loc.clone(), message: m })?;
        let mut locals = self.local_inits;
        locals.truncate(usize::from(self.high_water));
        Ok(GennedRoutine { name: def.name, locals, code, loc: def.loc.clone() })
    }

    /// Optional/auxiliary defaults. On V1-4 constant defaults live in
    /// the locals header; V5 locals start at zero, so defaults become
    /// code (guarded by `check_arg_count` for optionals).
    fn gen_param_default(
        &mut self,
        kind: ParamKind,
        slot: u8,
        default: &Value,
        def: &RoutineDef,
    ) -> CompileResult<()> {
        let constant = match self.resolver.resolve(default, &self.loc.clone()) {
            Ok(Imm::Const(c)) => Some(c),
            _ => None,
        };
        if self.version <= ZVersion::V4 {
            match constant {
                Some(c) => self.local_inits[usize::from(slot) - 1] = c as u16,
                None => {
                    // A computed default cannot be conditional on the
                    // argument count before V5.
                    self.diag.warn(
                        Some(def.loc.clone()),
                        "computed parameter default is evaluated unconditionally before V5",
                    )?;
                    self.gen_expr(default, Dest::Var(slot))?;
                }
            }
            return Ok(());
        }
        let skip = self.cb.new_label();
        if kind == ParamKind::Optional {
            self.emit(
                Op::CheckArgCount,
                &[Operand::Small(slot)],
                None,
                Some((true, BranchTarget::Label(skip))),
            )?;
        }
        self.gen_expr(default, Dest::Var(slot))?;
        if kind == ParamKind::Optional {
            self.bind(skip)?;
        }
        Ok(())
    }

    /// A leaf expression that can be a single operand, or None.
    fn leaf_operand(&mut self, v: &Value) -> CompileResult<Option<Operand>> {
        match v {
            Value::Int(n) => Ok(Some(Operand::constant(*n))),
            Value::Char(c) => Ok(Some(Operand::Small(*c))),
            Value::Atom(_) | Value::Quote(_) => self.atom_operand(v).map(Some),
            Value::String(s) => {
                let id = self.resolver.intern_string(s);
                Ok(Some(Operand::Ref(RefKind::StringOperand, id.as_u32())))
            }
            Value::Form(items) => {
                let Some(head) = items.first().and_then(Value::as_atom) else {
                    return Ok(None);
                };
                match self.name(head) {
                    "LVAL" => {
                        let o = self.lval_operand(&items[1..])?;
                        Ok(Some(o))
                    }
                    "GVAL" => {
                        let o = self.gval_operand(&items[1..])?;
                        Ok(Some(o))
                    }
                    "%TABLE%" => {
                        let id = self
                            .resolver
                            .tables
                            .ref_of(v)
                            .ok_or_else(|| self.err("malformed table reference"))?;
                        Ok(Some(Operand::constant(i32::from(self.resolver.table_addr(id)))))
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    fn atom_operand(&mut self, v: &Value) -> CompileResult<Operand> {
        let loc = self.loc.clone();
        match self.resolver.resolve(v, &loc)? {
            Imm::Const(c) => Ok(Operand::constant(c)),
            Imm::Ref(kind, index) => Ok(Operand::Ref(kind, index)),
        }
    }

    fn lval_operand(&mut self, args: &[Value]) -> CompileResult<Operand> {
        let Some(a) = args.first().and_then(Value::as_atom) else {
            return Err(self.err("malformed local variable reference"));
        };
        match self.local_of(a) {
            Some(slot) => Ok(Operand::Variable(slot)),
            None => Err(self.err(format!("undefined local {}", self.name(a)))),
        }
    }

    fn gval_operand(&mut self, args: &[Value]) -> CompileResult<Operand> {
        let Some(a) = args.first().and_then(Value::as_atom) else {
            return Err(self.err("malformed global variable reference"));
        };
        match self.resolver.world.lookup(a) {
            Some(Sym::Global(var)) => Ok(Operand::Variable(var)),
            // `,CONSTANT` and `,OBJECT` read as their values.
            Some(_) => self.atom_operand(&Value::Atom(a)),
            None => Err(self.err(format!("undefined global {}", self.name(a)))),
        }
    }

    /// A variable *number* operand for `SET`-family forms that address
    /// variables indirectly (inc, dec, dec_chk, store).
    fn variable_number(&mut self, v: &Value) -> CompileResult<u8> {
        let atom = match v {
            Value::Atom(a) => Some(*a),
            Value::Quote(q) => q.as_atom(),
            Value::Form(items) => {
                let head = items.first().and_then(Value::as_atom);
                match head.map(|h| self.name(h).to_owned()).as_deref() {
                    Some("LVAL") | Some("GVAL") => items.get(1).and_then(Value::as_atom),
                    _ => None,
                }
            }
            _ => None,
        };
        let Some(a) = atom else {
            return Err(self.err("expected a variable name"));
        };
        if let Some(slot) = self.local_of(a) {
            return Ok(slot);
        }
        match self.resolver.world.lookup(a) {
            Some(Sym::Global(var)) => Ok(var),
            _ => Err(self.err(format!("{} is not a variable", self.name(a)))),
        }
    }

    fn operand(&mut self, v: &Value) -> CompileResult<Operand> {
        if let Some(o) = self.leaf_operand(v)? {
            return Ok(o);
        }
        self.gen_expr(v, Dest::Push)?;
        Ok(Operand::Variable(0))
    }

    /// Evaluate several operands left-to-right. At most one may live on
    /// the stack (operand fetches pop most-recent-first, which would
    /// reverse the order); earlier complex operands go to scratch
    /// locals instead.
    fn operands(&mut self, vs: &[Value]) -> CompileResult<SmallVec<[Operand; 4]>> {
        let mut leaves: SmallVec<[Option<Operand>; 4]> = SmallVec::new();
        for v in vs {
            leaves.push(self.leaf_operand(v)?);
        }
        let mut remaining_complex = leaves.iter().filter(|o| o.is_none()).count();
        let mark = self.enter_scope();
        let mut out: SmallVec<[Operand; 4]> = SmallVec::new();
        for (v, leaf) in vs.iter().zip(leaves) {
            match leaf {
                Some(o) => out.push(o),
                None => {
                    remaining_complex -= 1;
                    if remaining_complex == 0 {
                        self.gen_expr(v, Dest::Push)?;
                        out.push(Operand::Variable(0));
                    } else {
                        let tmp = self.scratch_local()?;
                        self.gen_expr(v, Dest::Var(tmp))?;
                        out.push(Operand::Variable(tmp));
                    }
                }
            }
        }
        // Scratch slots stay live until the caller's instruction
        // consumes them; freeing the names here only allows reuse.
        self.exit_scope(mark);
        Ok(out)
    }

    /// One operand that is guaranteed not to be the stack.
    fn operand_not_stack(&mut self, v: &Value) -> CompileResult<Operand> {
        if let Some(o) = self.leaf_operand(v)? {
            return Ok(o);
        }
        let mark = self.enter_scope();
        let tmp = self.scratch_local()?;
        self.gen_expr(v, Dest::Var(tmp))?;
        self.exit_scope(mark);
        Ok(Operand::Variable(tmp))
    }

    /// Store/push a constant into `dest`.
    fn materialize(&mut self, o: Operand, dest: Dest) -> CompileResult<()> {
        match dest {
            Dest::Discard => Ok(()),
            Dest::Push => self.emit(Op::Push, &[o], None, None),
            // store's first operand is the variable *number*; the
            // second is an ordinary value.
            Dest::Var(v) => self.emit(Op::Store, &[Operand::Small(v), o], None, None),
        }
    }

    /// Valueless statements still satisfy a value demand with true.
    fn finish_valueless(&mut self, dest: Dest) -> CompileResult<()> {
        if dest != Dest::Discard {
            self.materialize(Operand::Small(1), dest)?;
        }
        Ok(())
    }

    /// A store-form instruction aimed at `dest`. On V1-4, a discarded
    /// result is stored to the stack and popped.
    fn emit_store_op(
        &mut self,
        op: Op,
        operands: &[Operand],
        dest: Dest,
    ) -> CompileResult<()> {
        self.emit(op, operands, Some(dest.store_byte()), None)?;
        if dest == Dest::Discard && self.version <= ZVersion::V4 {
            self.emit(Op::Pop, &[], None, None)?;
        }
        Ok(())
    }

    /// A store+branch instruction (get_child/get_sibling/scan_table) in
    /// value context: the mandatory branch goes to the next instruction.
    fn emit_store_branch_value(
        &mut self,
        op: Op,
        operands: &[Operand],
        dest: Dest,
    ) -> CompileResult<()> {
        let next = self.cb.new_label();
        self.emit(op, operands, Some(dest.store_byte()), Some((true, BranchTarget::Label(next))))?;
        self.bind(next)?;
        if dest == Dest::Discard && self.version <= ZVersion::V4 {
            self.emit(Op::Pop, &[], None, None)?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Expressions

    fn gen_body(&mut self, stmts: &[Value], dest: Dest) -> CompileResult<()> {
        match stmts.split_last() {
            None => self.finish_valueless(dest),
            Some((last, init)) => {
                for s in init {
                    self.gen_expr(s, Dest::Discard)?;
                }
                self.gen_expr(last, dest)
            }
        }
    }

    fn gen_expr(&mut self, v: &Value, dest: Dest) -> CompileResult<()> {
        if let Some(o) = self.leaf_operand(v)? {
            return self.materialize(o, dest);
        }
        let Value::Form(items) = v else {
            return Err(self.err("expression expected"));
        };
        let Some(head) = items.first().and_then(Value::as_atom) else {
            if items.is_empty() {
                // `<>` is plain false.
                return self.materialize(Operand::Small(0), dest);
            }
            return Err(self.err("form operator must be an atom"));
        };
        let args = &items[1..];
        let name = self.name(head).to_owned();
        trace!("lowering <{name} …> -> {dest:?}");

        match name.as_str() {
            // -- control flow ------------------------------------------------
            "COND" => self.gen_cond_form(args, dest),
            "AND" => self.gen_and_or_value(args, dest, true),
            "OR" => self.gen_and_or_value(args, dest, false),
            "NOT" => self.gen_bool_value(v, dest),
            "REPEAT" => self.gen_block(args, dest, true, None),
            "PROG" => {
                // An optional activation atom precedes the bindings.
                match args.split_first() {
                    Some((Value::Atom(act), rest)) => {
                        self.gen_block(rest, dest, false, Some(*act))
                    }
                    _ => self.gen_block(args, dest, false, None),
                }
            }
            "BIND" => {
                let mark = self.enter_scope();
                let rest = self.gen_bindings(args)?;
                let r = self.gen_body(rest, dest);
                self.exit_scope(mark);
                r
            }
            "RETURN" => self.gen_return(args),
            "AGAIN" => self.gen_again(args),
            "RTRUE" => self.emit(Op::Rtrue, &[], None, None),
            "RFALSE" => self.emit(Op::Rfalse, &[], None, None),
            "QUIT" => self.emit(Op::Quit, &[], None, None),
            "RESTART" => self.emit(Op::Restart, &[], None, None),
            "VERSION?" => self.gen_version_form(args, dest),
            "MAP-CONTENTS" => self.gen_map_contents(args, dest),
            "MAP-DIRECTIONS" => self.gen_map_directions(args, dest),
            "MAPF" | "MAPR" => self.gen_runtime_map(&name, args, dest),
            "CATCH" => {
                self.require(Op::Catch, "CATCH")?;
                self.emit(Op::Catch, &[], Some(dest.store_byte()), None)
            }
            "THROW" => {
                self.require(Op::Throw, "THROW")?;
                let ops = self.operands(args)?;
                self.emit(Op::Throw, &ops, None, None)
            }

            // -- predicates demanded as values -------------------------------
            "EQUAL?" | "==?" | "=?" | "N==?" | "N=?" | "ZERO?" | "0?" | "1?" | "L?"
            | "LESS?" | "G?" | "GRTR?" | "L=?" | "G=?" | "FSET?" | "IN?" | "BTST"
            | "DLESS?" | "IGRTR?" | "VERB?" | "ASSIGNED?" | "ORIGINAL?" => {
                self.gen_bool_value(v, dest)
            }
            "FIRST?" => {
                let ops = self.operands(args)?;
                self.emit_store_branch_value(Op::GetChild, &ops, dest)
            }
            "NEXT?" => {
                let ops = self.operands(args)?;
                self.emit_store_branch_value(Op::GetSibling, &ops, dest)
            }
            "INTBL?" => {
                self.require(Op::ScanTable, "INTBL?")?;
                let ops = self.operands(args)?;
                self.emit_store_branch_value(Op::ScanTable, &ops, dest)
            }

            // -- arithmetic --------------------------------------------------
            "+" | "ADD" => self.gen_nary(Op::Add, args, dest, 0),
            "-" | "SUB" => {
                if args.len() == 1 {
                    let o = self.operand(&args[0])?;
                    self.emit_store_op(Op::Sub, &[Operand::Small(0), o], dest)
                } else {
                    self.gen_nary(Op::Sub, args, dest, 0)
                }
            }
            "*" | "MUL" => self.gen_nary(Op::Mul, args, dest, 1),
            "/" | "DIV" => self.gen_nary(Op::Div, args, dest, 1),
            "MOD" => self.gen_binary_store(Op::Mod, args, dest),
            "BAND" | "ANDB" => self.gen_binary_store(Op::And, args, dest),
            "BOR" | "ORB" => self.gen_binary_store(Op::Or, args, dest),
            "BCOM" => {
                // `not` is 1OP before V5 and VAR from V5 on; the opcode
                // table sorts that out.
                let o = self.operand(args.first().ok_or_else(|| self.err("BCOM needs a value"))?)?;
                self.emit_store_op(Op::Not, &[o], dest)
            }
            "XORB" => {
                // a XOR b = (a|b) & ~(a&b); no native opcode exists.
                Err(self.err("XORB has no Z-machine encoding"))
            }
            "LSH" | "RSH" | "SHIFT" => self.gen_shift(&name, args, dest),
            "ASH" | "ASHIFT" => {
                self.require(Op::ArtShift, "ASH")?;
                let ops = self.operands(args)?;
                self.emit_store_op(Op::ArtShift, &ops, dest)
            }
            "RANDOM" => {
                let ops = self.operands(args)?;
                self.emit_store_op(Op::Random, &ops, dest)
            }
            "ABS" => {
                // |x| with a branch around the negation.
                let arg = args.first().ok_or_else(|| self.err("ABS needs a value"))?;
                let mark = self.enter_scope();
                let tmp = self.scratch_local()?;
                self.gen_expr(arg, Dest::Var(tmp))?;
                let done = self.cb.new_label();
                self.emit(
                    Op::Jl,
                    &[Operand::Variable(tmp), Operand::Small(0)],
                    None,
                    Some((false, BranchTarget::Label(done))),
                )?;
                self.emit(
                    Op::Sub,
                    &[Operand::Small(0), Operand::Variable(tmp)],
                    Some(tmp),
                    None,
                )?;
                self.bind(done)?;
                let r = self.materialize(Operand::Variable(tmp), dest);
                self.exit_scope(mark);
                r
            }

            // -- variables ---------------------------------------------------
            "SET" | "SETG" => self.gen_set(&name, args, dest),
            "VALUE" => {
                let var = self.variable_number(
                    args.first().ok_or_else(|| self.err("VALUE needs a variable"))?,
                )?;
                self.emit_store_op(Op::Load, &[Operand::Small(var)], dest)
            }
            "INC" => {
                let var = self.variable_number(
                    args.first().ok_or_else(|| self.err("INC needs a variable"))?,
                )?;
                self.emit(Op::Inc, &[Operand::Small(var)], None, None)?;
                if dest != Dest::Discard {
                    self.emit_store_op(Op::Load, &[Operand::Small(var)], dest)?;
                }
                Ok(())
            }
            "DEC" => {
                let var = self.variable_number(
                    args.first().ok_or_else(|| self.err("DEC needs a variable"))?,
                )?;
                self.emit(Op::Dec, &[Operand::Small(var)], None, None)?;
                if dest != Dest::Discard {
                    self.emit_store_op(Op::Load, &[Operand::Small(var)], dest)?;
                }
                Ok(())
            }
            "PUSH" => {
                let ops = self.operands(args)?;
                self.emit(Op::Push, &ops, None, None)?;
                self.finish_valueless(dest)
            }
            "POP" => {
                let var = self.variable_number(
                    args.first().ok_or_else(|| self.err("POP needs a variable"))?,
                )?;
                if self.version == ZVersion::V6 {
                    self.emit(Op::Pull, &[], Some(var), None)
                } else {
                    self.emit(Op::Pull, &[Operand::Small(var)], None, None)
                }
            }

            // -- objects -----------------------------------------------------
            "MOVE" => self.gen_plain(Op::InsertObj, args, dest),
            "REMOVE" => self.gen_plain(Op::RemoveObj, args, dest),
            "FSET" => self.gen_plain(Op::SetAttr, args, dest),
            "FCLEAR" => self.gen_plain(Op::ClearAttr, args, dest),
            "LOC" => {
                let ops = self.operands(args)?;
                self.emit_store_op(Op::GetParent, &ops, dest)
            }

            // -- properties & tables -----------------------------------------
            "GETP" => self.gen_store(Op::GetProp, args, dest),
            "GETPT" => self.gen_store(Op::GetPropAddr, args, dest),
            "NEXTP" => self.gen_store(Op::GetNextProp, args, dest),
            "PTSIZE" => self.gen_store(Op::GetPropLen, args, dest),
            "PUTP" => self.gen_plain(Op::PutProp, args, dest),
            "GET" => self.gen_store(Op::Loadw, args, dest),
            "GETB" => self.gen_store(Op::Loadb, args, dest),
            "PUT" => self.gen_plain(Op::Storew, args, dest),
            "PUTB" => self.gen_plain(Op::Storeb, args, dest),
            "REST" => self.gen_nary(Op::Add, args, dest, 0),
            "COPYT" => {
                self.require(Op::CopyTable, "COPYT")?;
                self.gen_plain(Op::CopyTable, args, dest)
            }
            "ZWSTR" => {
                self.require(Op::EncodeText, "ZWSTR")?;
                self.gen_plain(Op::EncodeText, args, dest)
            }
            "LEX" => {
                self.require(Op::Tokenise, "LEX")?;
                self.gen_plain(Op::Tokenise, args, dest)
            }

            // -- input/output ------------------------------------------------
            "TELL" => {
                self.gen_tell(args)?;
                self.finish_valueless(dest)
            }
            "PRINT" => {
                let ops = self.operands(args)?;
                self.emit(Op::PrintPaddr, &ops, None, None)?;
                self.finish_valueless(dest)
            }
            "PRINTI" => {
                let Some(Value::String(s)) = args.first() else {
                    return Err(self.err("PRINTI needs a string"));
                };
                let id = self.resolver.intern_string(s);
                self.emit(
                    Op::PrintPaddr,
                    &[Operand::Ref(RefKind::TellString, id.as_u32())],
                    None,
                    None,
                )?;
                self.finish_valueless(dest)
            }
            "PRINTR" => {
                let Some(Value::String(s)) = args.first() else {
                    return Err(self.err("PRINTR needs a string"));
                };
                let id = self.resolver.intern_string(s);
                self.emit(
                    Op::PrintPaddr,
                    &[Operand::Ref(RefKind::TellString, id.as_u32())],
                    None,
                    None,
                )?;
                self.emit(Op::NewLine, &[], None, None)?;
                self.emit(Op::Rtrue, &[], None, None)
            }
            "PRINTB" => self.gen_plain(Op::PrintAddr, args, dest),
            "PRINTC" => self.gen_plain(Op::PrintChar, args, dest),
            "PRINTD" => self.gen_plain(Op::PrintObj, args, dest),
            "PRINTN" => self.gen_plain(Op::PrintNum, args, dest),
            "PRINTT" => {
                self.require(Op::PrintTable, "PRINTT")?;
                self.gen_plain(Op::PrintTable, args, dest)
            }
            "PRINTU" => {
                self.require(Op::PrintUnicode, "PRINTU")?;
                self.gen_plain(Op::PrintUnicode, args, dest)
            }
            "CHECKU" => {
                self.require(Op::CheckUnicode, "CHECKU")?;
                self.gen_store(Op::CheckUnicode, args, dest)
            }
            "CR" | "CRLF" => {
                self.emit(Op::NewLine, &[], None, None)?;
                self.finish_valueless(dest)
            }
            "READ" => {
                let ops = self.operands(args)?;
                if self.version >= ZVersion::V5 {
                    self.emit_store_op(Op::Sread, &ops, dest)
                } else {
                    self.emit(Op::Sread, &ops, None, None)?;
                    self.finish_valueless(dest)
                }
            }
            "INPUT" => {
                self.require(Op::ReadChar, "INPUT")?;
                let ops = self.operands(args)?;
                self.emit_store_op(Op::ReadChar, &ops, dest)
            }
            "USL" => self.degradable(Op::ShowStatus, "USL", &[], dest),
            "SOUND" => self.gen_plain(Op::SoundEffect, args, dest),
            "COLOR" => {
                if Op::SetColour.info(self.version).is_some() {
                    self.gen_plain(Op::SetColour, args, dest)
                } else {
                    self.degrade_warn("COLOR")?;
                    for a in args {
                        self.gen_expr(a, Dest::Discard)?;
                    }
                    self.finish_valueless(dest)
                }
            }
            "HLIGHT" => {
                if Op::SetTextStyle.info(self.version).is_some() {
                    self.gen_plain(Op::SetTextStyle, args, dest)
                } else {
                    self.degrade_warn("HLIGHT")?;
                    self.finish_valueless(dest)
                }
            }
            "FONT" => {
                if Op::SetFont.info(self.version).is_some() {
                    self.gen_store(Op::SetFont, args, dest)
                } else {
                    self.degrade_warn("FONT")?;
                    self.materialize(Operand::Small(0), dest)
                }
            }
            "CURSET" => {
                self.require(Op::SetCursor, "CURSET")?;
                self.gen_plain(Op::SetCursor, args, dest)
            }
            "CURGET" => {
                self.require(Op::GetCursor, "CURGET")?;
                self.gen_plain(Op::GetCursor, args, dest)
            }
            "SCREEN" => self.gen_plain(Op::SetWindow, args, dest),
            "SPLIT" => self.gen_plain(Op::SplitWindow, args, dest),
            "CLEAR" => {
                self.require(Op::EraseWindow, "CLEAR")?;
                self.gen_plain(Op::EraseWindow, args, dest)
            }
            "DIROUT" => self.gen_plain(Op::OutputStream, args, dest),
            "DIRIN" => self.gen_plain(Op::InputStream, args, dest),
            "BUFOUT" => {
                self.require(Op::BufferMode, "BUFOUT")?;
                self.gen_plain(Op::BufferMode, args, dest)
            }
            "ERASE" => {
                self.require(Op::EraseLine, "ERASE")?;
                self.gen_plain(Op::EraseLine, args, dest)
            }
            "DISPLAY" => {
                self.require(Op::DrawPicture, "DISPLAY")?;
                self.gen_plain(Op::DrawPicture, args, dest)
            }

            // -- whole-machine -----------------------------------------------
            "SAVE" => match Op::Save.info(self.version) {
                Some(i) if i.branch => self.gen_bool_value(v, dest),
                Some(_) => self.emit_store_op(Op::Save, &[], dest),
                None => Err(self.err("SAVE is not available here")),
            },
            "RESTORE" => match Op::Restore.info(self.version) {
                Some(i) if i.branch => self.gen_bool_value(v, dest),
                Some(_) => self.emit_store_op(Op::Restore, &[], dest),
                None => Err(self.err("RESTORE is not available here")),
            },
            "ISAVE" => {
                self.require(Op::SaveUndo, "ISAVE")?;
                self.emit_store_op(Op::SaveUndo, &[], dest)
            }
            "IRESTORE" => {
                self.require(Op::RestoreUndo, "IRESTORE")?;
                self.emit_store_op(Op::RestoreUndo, &[], dest)
            }
            "VERIFY" => self.gen_bool_value(v, dest),
            "NOOP" => self.emit(Op::Nop, &[], None, None),

            // -- calls -------------------------------------------------------
            "CALL" | "APPLY" => {
                let Some((routine, rest)) = args.split_first() else {
                    return Err(self.err("CALL needs a routine"));
                };
                self.gen_call(routine, rest, dest, false)
            }
            _ => {
                // A routine name in operator position is a call; the
                // arity is checked against its declaration.
                match self.resolver.world.lookup(head) {
                    Some(Sym::Routine(_)) => {
                        self.gen_call(&Value::Atom(head), args, dest, true)
                    }
                    _ => Err(self.err(format!("unknown operation {name}"))),
                }
            }
        }
    }

    fn require(&self, op: Op, what: &str) -> CompileResult<()> {
        if op.info(self.version).is_none() {
            return Err(self.err(format!("{what} is not available on {}", self.version)));
        }
        Ok(())
    }

    fn degrade_warn(&mut self, what: &str) -> CompileResult<()> {
        self.diag.warn(
            Some(self.loc.clone()),
            format!("{what} does nothing on {}", self.version),
        )
    }

    fn degradable(
        &mut self,
        op: Op,
        what: &str,
        operands: &[Operand],
        dest: Dest,
    ) -> CompileResult<()> {
        if op.info(self.version).is_some() {
            self.emit(op, operands, None, None)?;
        } else {
            self.degrade_warn(what)?;
        }
        self.finish_valueless(dest)
    }

    /// Ops with no store byte.
    fn gen_plain(&mut self, op: Op, args: &[Value], dest: Dest) -> CompileResult<()> {
        let ops = self.operands(args)?;
        self.emit(op, &ops, None, None)?;
        self.finish_valueless(dest)
    }

    /// Ops with a store byte.
    fn gen_store(&mut self, op: Op, args: &[Value], dest: Dest) -> CompileResult<()> {
        let ops = self.operands(args)?;
        self.emit_store_op(op, &ops, dest)
    }

    fn gen_binary_store(&mut self, op: Op, args: &[Value], dest: Dest) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.err("this operation takes exactly two values"));
        }
        self.gen_store(op, args, dest)
    }

    /// Left-folded n-ary arithmetic: `<+ a b c>` is `(a+b)+c`.
    fn gen_nary(&mut self, op: Op, args: &[Value], dest: Dest, identity: i32) -> CompileResult<()> {
        match args.len() {
            0 => self.materialize(Operand::constant(identity), dest),
            1 => {
                let o = self.operand(&args[0])?;
                self.materialize(o, dest)
            }
            2 => self.gen_store(op, args, dest),
            _ => {
                let firsts = self.operands(&args[..2])?;
                self.emit(op, &firsts, Some(0), None)?;
                for (i, a) in args[2..].iter().enumerate() {
                    // The accumulator sits on the stack; the next
                    // operand must stay off it.
                    let o = self.operand_not_stack(a)?;
                    let last = i == args.len() - 3;
                    let store = if last { dest.store_byte() } else { 0 };
                    self.emit(op, &[Operand::Variable(0), o], Some(store), None)?;
                    if last && dest == Dest::Discard && self.version <= ZVersion::V4 {
                        self.emit(Op::Pop, &[], None, None)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn gen_shift(&mut self, name: &str, args: &[Value], dest: Dest) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.err(format!("{name} needs a value and a place count")));
        }
        if Op::LogShift.info(self.version).is_some() {
            let value = self.operand_not_stack(&args[0])?;
            let places = match (name, &args[1]) {
                ("RSH", Value::Int(n)) => Operand::constant(-n),
                (_, v) => self.operand(v)?,
            };
            return self.emit_store_op(Op::LogShift, &[value, places], dest);
        }
        // Below V5: multiply or divide by a power of two, constants only.
        let [value, Value::Int(places)] = args else {
            return Err(self.err(format!(
                "{name} needs a constant shift count before V5"
            )));
        };
        self.diag.warn(
            Some(self.loc.clone()),
            format!("{name} lowered to multiplication on {}", self.version),
        )?;
        let (op, amount) = match name {
            "RSH" => (Op::Div, *places),
            _ if *places < 0 => (Op::Div, -places),
            _ => (Op::Mul, *places),
        };
        let factor = 1i32 << amount.clamp(0, 15);
        let o = self.operand(value)?;
        self.emit_store_op(op, &[o, Operand::constant(factor)], dest)
    }

    fn gen_set(&mut self, name: &str, args: &[Value], dest: Dest) -> CompileResult<()> {
        let [target, value] = args else {
            return Err(self.err(format!("{name} needs a variable and a value")));
        };
        // MDL distinguishes SET (locals) from SETG (globals);
        // variable_number accepts either for both, as ZILF does.
        let _ = name;
        let var = self.variable_number(target)?;
        self.gen_expr(value, Dest::Var(var))?;
        if dest != Dest::Discard {
            self.emit_store_op(Op::Load, &[Operand::Small(var)], dest)?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Predicates

    /// Branch to `target` when the predicate's truth equals `want`.
    fn gen_cond(&mut self, pred: &Value, target: CondTarget, want: bool) -> CompileResult<()> {
        match pred {
            Value::Atom(a) if self.name(*a) == "T" || self.name(*a) == "ELSE" => {
                return self.gen_goto(target, want, true);
            }
            Value::Int(n) => return self.gen_goto(target, want, *n != 0),
            v if v.is_false() => return self.gen_goto(target, want, false),
            _ => {}
        }

        let Value::Form(items) = pred else {
            // Other leaves (strings, atoms naming things) are truthy.
            return self.gen_goto(target, want, true);
        };
        let head = items.first().and_then(Value::as_atom);
        let args = &items[1..];
        let name = head.map(|h| self.name(h).to_owned()).unwrap_or_default();

        match name.as_str() {
            "NOT" | "F?" => {
                let inner = args.first().ok_or_else(|| self.err("NOT needs a value"))?;
                self.gen_cond(inner, target, !want)
            }
            "AND" => {
                if args.is_empty() {
                    return self.gen_goto(target, want, true);
                }
                if want {
                    let escape = self.cb.new_label();
                    for a in &args[..args.len() - 1] {
                        self.gen_cond(a, CondTarget::Label(escape), false)?;
                    }
                    self.gen_cond(args.last().unwrap(), target, true)?;
                    self.bind(escape)
                } else {
                    for a in args {
                        self.gen_cond(a, target, false)?;
                    }
                    Ok(())
                }
            }
            "OR" => {
                if args.is_empty() {
                    return self.gen_goto(target, want, false);
                }
                if want {
                    for a in args {
                        self.gen_cond(a, target, true)?;
                    }
                    Ok(())
                } else {
                    let escape = self.cb.new_label();
                    for a in &args[..args.len() - 1] {
                        self.gen_cond(a, CondTarget::Label(escape), true)?;
                    }
                    self.gen_cond(args.last().unwrap(), target, false)?;
                    self.bind(escape)
                }
            }
            "EQUAL?" | "==?" | "=?" => self.gen_equality(args, target, want),
            "N==?" | "N=?" => self.gen_equality(args, target, !want),
            "ZERO?" | "0?" => {
                let o = self.operand(args.first().ok_or_else(|| self.err("ZERO? needs a value"))?)?;
                self.emit(Op::Jz, &[o], None, Some((want, target.branch())))
            }
            "1?" => {
                let o = self.operand(args.first().ok_or_else(|| self.err("1? needs a value"))?)?;
                self.emit(Op::Je, &[o, Operand::Small(1)], None, Some((want, target.branch())))
            }
            "L?" | "LESS?" => self.gen_compare(Op::Jl, args, target, want),
            "G?" | "GRTR?" => self.gen_compare(Op::Jg, args, target, want),
            // not-greater / not-less compile with inverted polarity.
            "L=?" => self.gen_compare(Op::Jg, args, target, !want),
            "G=?" => self.gen_compare(Op::Jl, args, target, !want),
            "FSET?" => self.gen_compare(Op::TestAttr, args, target, want),
            "IN?" => self.gen_compare(Op::Jin, args, target, want),
            "BTST" => self.gen_compare(Op::Test, args, target, want),
            "DLESS?" | "IGRTR?" => {
                let [var, bound] = args else {
                    return Err(self.err(format!("{name} needs a variable and a bound")));
                };
                let var = self.variable_number(var)?;
                let o = self.operand(bound)?;
                let op = if name == "DLESS?" { Op::DecChk } else { Op::IncChk };
                self.emit(op, &[Operand::Small(var), o], None, Some((want, target.branch())))
            }
            "FIRST?" => {
                let ops = self.operands(args)?;
                self.emit(Op::GetChild, &ops, Some(0), Some((want, target.branch())))
            }
            "NEXT?" => {
                let ops = self.operands(args)?;
                self.emit(Op::GetSibling, &ops, Some(0), Some((want, target.branch())))
            }
            "INTBL?" => {
                self.require(Op::ScanTable, "INTBL?")?;
                let ops = self.operands(args)?;
                self.emit(Op::ScanTable, &ops, Some(0), Some((want, target.branch())))
            }
            "VERB?" => self.gen_verb_pred(args, target, want),
            "ASSIGNED?" => {
                self.require(Op::CheckArgCount, "ASSIGNED?")?;
                let a = args
                    .first()
                    .and_then(Value::as_atom)
                    .ok_or_else(|| self.err("ASSIGNED? needs a parameter name"))?;
                let slot = self
                    .local_of(a)
                    .ok_or_else(|| self.err(format!("{} is not a parameter", self.name(a))))?;
                self.emit(
                    Op::CheckArgCount,
                    &[Operand::Small(slot)],
                    None,
                    Some((want, target.branch())),
                )
            }
            "ORIGINAL?" => {
                self.require(Op::Piracy, "ORIGINAL?")?;
                self.emit(Op::Piracy, &[], None, Some((want, target.branch())))
            }
            "VERIFY" => self.emit(Op::Verify, &[], None, Some((want, target.branch()))),
            "SAVE" if matches!(Op::Save.info(self.version), Some(i) if i.branch) => {
                self.emit(Op::Save, &[], None, Some((want, target.branch())))
            }
            "RESTORE" if matches!(Op::Restore.info(self.version), Some(i) if i.branch) => {
                self.emit(Op::Restore, &[], None, Some((want, target.branch())))
            }
            _ => {
                // A general expression: test its value against zero.
                self.gen_expr(pred, Dest::Push)?;
                self.emit(Op::Jz, &[Operand::Variable(0)], None, Some((!want, target.branch())))
            }
        }
    }

    /// An unconditional "branch" decided at compile time.
    fn gen_goto(&mut self, target: CondTarget, want: bool, truth: bool) -> CompileResult<()> {
        if want != truth {
            return Ok(());
        }
        match target {
            CondTarget::Label(l) => self.jump(l),
            CondTarget::ReturnTrue => self.emit(Op::Rtrue, &[], None, None),
            CondTarget::ReturnFalse => self.emit(Op::Rfalse, &[], None, None),
        }
    }

    fn gen_compare(
        &mut self,
        op: Op,
        args: &[Value],
        target: CondTarget,
        want: bool,
    ) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.err("comparison takes exactly two values"));
        }
        let ops = self.operands(args)?;
        self.emit(op, &ops, None, Some((want, target.branch())))
    }

    /// `EQUAL?` with up to 3 comparands per `je`, chained beyond that.
    fn gen_equality(&mut self, args: &[Value], target: CondTarget, want: bool) -> CompileResult<()> {
        let Some((subject, comparands)) = args.split_first() else {
            return Err(self.err("EQUAL? needs a subject"));
        };
        if comparands.is_empty() {
            return Err(self.err("EQUAL? needs at least one comparand"));
        }
        // The subject is fetched once per je; it cannot live on the
        // stack when the comparands follow it.
        let subject_op = self.operand_not_stack(subject)?;
        if want {
            for group in comparands.chunks(3) {
                let mut ops: SmallVec<[Operand; 4]> = SmallVec::new();
                ops.push(subject_op);
                // Comparand order within a je does not matter, so stack
                // temporaries are safe here.
                for c in group {
                    ops.push(self.operand_not_stack(c)?);
                }
                self.emit(Op::Je, &ops, None, Some((true, target.branch())))?;
            }
            Ok(())
        } else {
            // Branch only when the subject matches none of them.
            let matched = self.cb.new_label();
            for group in comparands.chunks(3) {
                let mut ops: SmallVec<[Operand; 4]> = SmallVec::new();
                ops.push(subject_op);
                for c in group {
                    ops.push(self.operand_not_stack(c)?);
                }
                self.emit(Op::Je, &ops, None, Some((true, BranchTarget::Label(matched))))?;
            }
            self.gen_goto(target, true, true)?;
            self.bind(matched)
        }
    }

    /// `AND`/`OR` demanded as values. The value of an AND is its last
    /// operand (or false); the value of an OR is its first truthy
    /// operand.
    fn gen_and_or_value(&mut self, args: &[Value], dest: Dest, is_and: bool) -> CompileResult<()> {
        if args.is_empty() {
            return self.materialize(Operand::Small(is_and as u8), dest);
        }
        if dest == Dest::Discard {
            let done = self.cb.new_label();
            let (init, last) = (&args[..args.len() - 1], &args[args.len() - 1]);
            for a in init {
                self.gen_cond(a, CondTarget::Label(done), !is_and)?;
            }
            self.gen_expr(last, Dest::Discard)?;
            return self.bind(done);
        }

        let mark = self.enter_scope();
        let tmp = match dest {
            Dest::Var(v) => v,
            _ => self.scratch_local()?,
        };
        let done = self.cb.new_label();
        let (init, last) = (&args[..args.len() - 1], &args[args.len() - 1]);
        if is_and {
            let fail = self.cb.new_label();
            for a in init {
                self.gen_cond(a, CondTarget::Label(fail), false)?;
            }
            self.gen_expr(last, Dest::Var(tmp))?;
            self.jump(done)?;
            self.bind(fail)?;
            self.materialize(Operand::Small(0), Dest::Var(tmp))?;
            self.bind(done)?;
        } else {
            for a in init {
                self.gen_expr(a, Dest::Var(tmp))?;
                // Keep the first truthy value.
                self.emit(
                    Op::Jz,
                    &[Operand::Variable(tmp)],
                    None,
                    Some((false, BranchTarget::Label(done))),
                )?;
            }
            self.gen_expr(last, Dest::Var(tmp))?;
            self.bind(done)?;
        }
        if dest == Dest::Push {
            self.emit(Op::Push, &[Operand::Variable(tmp)], None, None)?;
        }
        self.exit_scope(mark);
        Ok(())
    }

    /// `<VERB? TAKE DROP …>` compares PRSA against action constants.
    fn gen_verb_pred(&mut self, args: &[Value], target: CondTarget, want: bool) -> CompileResult<()> {
        let prsa = self.resolver.interner.intern("PRSA");
        let Some(Sym::Global(var)) = self.resolver.world.lookup(prsa) else {
            return Err(self.err("VERB? needs a PRSA global"));
        };
        let mut comparands = Vec::with_capacity(args.len());
        for a in args {
            let verb = a.as_atom().ok_or_else(|| self.err("VERB? takes verb names"))?;
            let name = self.name(verb).to_owned();
            let act = self.resolver.interner.intern(&format!("ACT?{name}"));
            let Some(&imm) = self.resolver.special.get(&act) else {
                return Err(self.err(format!("{name} is not a defined verb")));
            };
            let Imm::Const(c) = imm else { unreachable!() };
            comparands.push(Value::Int(c));
        }
        let _ = var;
        let mut all = vec![Value::Form(vec![
            Value::Atom(self.resolver.interner.intern("GVAL")),
            Value::Atom(prsa),
        ])];
        all.extend(comparands);
        self.gen_equality(&all, target, want)
    }

    /// A predicate demanded as a value: 1 or 0.
    fn gen_bool_value(&mut self, pred: &Value, dest: Dest) -> CompileResult<()> {
        if dest == Dest::Discard {
            // Only the side effects matter.
            let skip = self.cb.new_label();
            self.gen_cond(pred, CondTarget::Label(skip), true)?;
            return self.bind(skip);
        }
        let yes = self.cb.new_label();
        let done = self.cb.new_label();
        self.gen_cond(pred, CondTarget::Label(yes), true)?;
        self.materialize(Operand::Small(0), dest)?;
        self.jump(done)?;
        self.bind(yes)?;
        self.materialize(Operand::Small(1), dest)?;
        self.bind(done)
    }

    // ----------------------------------------------------------------
    // Control-flow forms

    fn gen_cond_form(&mut self, clauses: &[Value], dest: Dest) -> CompileResult<()> {
        let end = self.cb.new_label();
        let mut always_taken = false;

        let rtrue = self.resolver.interner.intern("RTRUE");
        let rfalse = self.resolver.interner.intern("RFALSE");

        for clause in clauses {
            let Value::List(clause) = clause else {
                return Err(self.err("COND clause must be a list"));
            };
            let Some((pred, body)) = clause.split_first() else {
                return Err(self.err("empty COND clause"));
            };
            let unconditional = matches!(
                pred.as_atom().map(|a| self.name(a)),
                Some("T") | Some("ELSE")
            );

            // A clause that just returns can branch straight there:
            // return-true/false are control transfers, so this holds
            // for any destination.
            if body.len() == 1 {
                if body[0].form_args(rtrue).is_some_and(<[Value]>::is_empty) {
                    self.gen_cond(pred, CondTarget::ReturnTrue, true)?;
                    if unconditional {
                        always_taken = true;
                        break;
                    }
                    continue;
                }
                if body[0].form_args(rfalse).is_some_and(<[Value]>::is_empty) {
                    self.gen_cond(pred, CondTarget::ReturnFalse, true)?;
                    if unconditional {
                        always_taken = true;
                        break;
                    }
                    continue;
                }
            }

            if unconditional {
                self.gen_body(body, dest)?;
                always_taken = true;
                break;
            }

            let next = self.cb.new_label();
            if body.is_empty() {
                // The predicate's own value is the clause value.
                let mark = self.enter_scope();
                let tmp = self.scratch_local()?;
                self.gen_expr(pred, Dest::Var(tmp))?;
                self.emit(
                    Op::Jz,
                    &[Operand::Variable(tmp)],
                    None,
                    Some((true, BranchTarget::Label(next))),
                )?;
                self.materialize(Operand::Variable(tmp), dest)?;
                self.exit_scope(mark);
            } else {
                self.gen_cond(pred, CondTarget::Label(next), false)?;
                self.gen_body(body, dest)?;
            }
            if !self.cb.terminated() {
                self.jump(end)?;
            }
            self.bind(next)?;
        }

        if !always_taken && dest != Dest::Discard {
            // Every predicate false: the COND is false.
            self.materialize(Operand::Small(0), dest)?;
        }
        self.bind(end)
    }

    fn gen_version_form(&mut self, clauses: &[Value], dest: Dest) -> CompileResult<()> {
        for clause in clauses {
            let Value::List(clause) = clause else {
                return Err(self.err("VERSION? clause must be a list"));
            };
            let Some((head, body)) = clause.split_first() else { continue };
            let matches = match head {
                Value::Int(n) => *n == i32::from(self.version.number()),
                Value::Atom(a) => matches!(
                    (self.name(*a), self.version.number()),
                    ("ZIP", 3) | ("EZIP", 4) | ("XZIP", 5) | ("YZIP", 6) | ("T", _) | ("ELSE", _)
                ),
                _ => false,
            };
            if matches {
                return self.gen_body(body, dest);
            }
        }
        self.finish_valueless(dest)
    }

    /// Leading `(bindings)` of PROG/REPEAT/BIND. Returns the body.
    fn gen_bindings<'v>(&mut self, args: &'v [Value]) -> CompileResult<&'v [Value]> {
        let Some(Value::List(bindings)) = args.first() else {
            return Err(self.err("expected a binding list"));
        };
        for b in bindings {
            match b {
                Value::Atom(a) => {
                    let slot = self.alloc_local(*a)?;
                    // Fresh bindings start false even on re-entry.
                    self.emit(
                        Op::Store,
                        &[Operand::Small(slot), Operand::Small(0)],
                        None,
                        None,
                    )?;
                }
                Value::List(pair) => {
                    let [Value::Atom(a), init] = pair.as_slice() else {
                        return Err(self.err("binding must be (name value)"));
                    };
                    let slot = self.alloc_local(*a)?;
                    self.gen_expr(init, Dest::Var(slot))?;
                }
                _ => return Err(self.err("malformed binding")),
            }
        }
        Ok(&args[1..])
    }

    fn gen_block(
        &mut self,
        args: &[Value],
        dest: Dest,
        repeat: bool,
        name: Option<zilc_frontend::intern::Atom>,
    ) -> CompileResult<()> {
        let mark = self.enter_scope();
        let body = self.gen_bindings(args)?;
        let start = self.cb.new_label();
        let end = self.cb.new_label();
        self.bind(start)?;
        self.loops.push(LoopCx { name, start, end, dest });

        if repeat {
            for stmt in body {
                self.gen_expr(stmt, Dest::Discard)?;
            }
        } else {
            self.gen_body(body, dest)?;
        }

        self.loops.pop();
        self.exit_scope(mark);
        if repeat {
            self.jump(start)?;
        }
        self.bind(end)
    }

    fn gen_return(&mut self, args: &[Value]) -> CompileResult<()> {
        // `<RETURN [value [activation]]>`.
        let (value, name) = match args {
            [] => (None, None),
            [v] => (Some(v), None),
            [v, Value::Atom(a)] => (Some(v), Some(*a)),
            _ => return Err(self.err("malformed RETURN")),
        };
        let target = match name {
            Some(n) => self.loops.iter().rposition(|l| l.name == Some(n)),
            None => self.loops.len().checked_sub(1),
        };
        match target {
            Some(i) => {
                let (end, dest) = (self.loops[i].end, self.loops[i].dest);
                match value {
                    Some(v) => self.gen_expr(v, dest)?,
                    None => self.materialize(Operand::Small(1), dest)?,
                }
                self.jump(end)
            }
            None => match value {
                None => self.emit(Op::Rtrue, &[], None, None),
                Some(v) => {
                    let o = self.operand(v)?;
                    match o {
                        Operand::Small(1) => self.emit(Op::Rtrue, &[], None, None),
                        Operand::Small(0) => self.emit(Op::Rfalse, &[], None, None),
                        o => self.emit(Op::Ret, &[o], None, None),
                    }
                }
            },
        }
    }

    fn gen_again(&mut self, args: &[Value]) -> CompileResult<()> {
        let target = match args.first().and_then(Value::as_atom) {
            Some(n) => self.loops.iter().rposition(|l| l.name == Some(n)),
            None => self.loops.len().checked_sub(1),
        };
        match target {
            Some(i) => {
                let start = self.loops[i].start;
                self.jump(start)
            }
            None => Err(self.err("AGAIN outside of a loop")),
        }
    }

    // ----------------------------------------------------------------
    // Iteration forms

    /// `<MAP-CONTENTS (VAR [NEXT] container) body…>`
    fn gen_map_contents(&mut self, args: &[Value], dest: Dest) -> CompileResult<()> {
        let Some(Value::List(spec)) = args.first() else {
            return Err(self.err("MAP-CONTENTS needs (var [next] container)"));
        };
        let body = &args[1..];
        let mark = self.enter_scope();
        let (var, next_var, container) = match spec.as_slice() {
            [Value::Atom(v), c] => (self.alloc_local(*v)?, None, c),
            [Value::Atom(v), Value::Atom(n), c] => {
                (self.alloc_local(*v)?, Some(self.alloc_local(*n)?), c)
            }
            _ => return Err(self.err("MAP-CONTENTS needs (var [next] container)")),
        };
        let container = self.operand(container)?;

        let start = self.cb.new_label();
        let end = self.cb.new_label();
        self.emit(
            Op::GetChild,
            &[container],
            Some(var),
            Some((false, BranchTarget::Label(end))),
        )?;
        self.bind(start)?;
        self.loops.push(LoopCx { name: None, start, end, dest: Dest::Discard });
        if let Some(next) = next_var {
            // Fetch the sibling before the body so the body may move
            // the current object.
            self.emit_store_branch_value(Op::GetSibling, &[Operand::Variable(var)], Dest::Var(next))?;
        }
        for stmt in body {
            self.gen_expr(stmt, Dest::Discard)?;
        }
        match next_var {
            Some(next) => {
                self.emit(
                    Op::Store,
                    &[Operand::Small(var), Operand::Variable(next)],
                    None,
                    None,
                )?;
                self.emit(
                    Op::Jz,
                    &[Operand::Variable(var)],
                    None,
                    Some((false, BranchTarget::Label(start))),
                )?;
            }
            None => {
                self.emit(
                    Op::GetSibling,
                    &[Operand::Variable(var)],
                    Some(var),
                    Some((true, BranchTarget::Label(start))),
                )?;
            }
        }
        self.loops.pop();
        self.exit_scope(mark);
        self.bind(end)?;
        self.finish_valueless(dest)
    }

    /// `<MAP-DIRECTIONS (DIR PT room) body…>`: unrolled over the
    /// declared directions, highest property first.
    fn gen_map_directions(&mut self, args: &[Value], dest: Dest) -> CompileResult<()> {
        let Some(Value::List(spec)) = args.first() else {
            return Err(self.err("MAP-DIRECTIONS needs (dir pt room)"));
        };
        let body = &args[1..];
        let [Value::Atom(dir_var), Value::Atom(pt_var), room] = spec.as_slice() else {
            return Err(self.err("MAP-DIRECTIONS needs (dir pt room)"));
        };
        let mark = self.enter_scope();
        let dir_slot = self.alloc_local(*dir_var)?;
        let pt_slot = self.alloc_local(*pt_var)?;
        let room_op = self.operand(room)?;

        let directions = self.resolver.world.directions.clone();
        for (_, prop) in directions {
            let skip = self.cb.new_label();
            self.emit(
                Op::GetPropAddr,
                &[room_op, Operand::Small(prop)],
                Some(pt_slot),
                None,
            )?;
            self.emit(
                Op::Jz,
                &[Operand::Variable(pt_slot)],
                None,
                Some((true, BranchTarget::Label(skip))),
            )?;
            self.emit(
                Op::Store,
                &[Operand::Small(dir_slot), Operand::Small(prop)],
                None,
                None,
            )?;
            for stmt in body {
                self.gen_expr(stmt, Dest::Discard)?;
            }
            self.bind(skip)?;
        }
        self.exit_scope(mark);
        self.finish_valueless(dest)
    }

    /// Runtime MAPF/MAPR over a compile-time structure: unrolled when
    /// small, a counted loop over a lowered table otherwise.
    fn gen_runtime_map(&mut self, name: &str, args: &[Value], dest: Dest) -> CompileResult<()> {
        let [collector, function, structure] = args else {
            return Err(self.err(format!("{name} needs a collector, a function and a list")));
        };
        if !collector.is_false() {
            return Err(self.err(format!("runtime {name} supports only the <> collector")));
        }
        let (param, body) = self.function_literal(function)?;

        if name == "MAPR" && matches!(structure, Value::List(_) | Value::Vector(_)) {
            return Err(self.err("runtime MAPR needs a table structure"));
        }

        // Unrolled path: a literal list of at most 8 elements.
        if let Value::List(elems) | Value::Vector(elems) = structure {
            if elems.len() <= 8 {
                let mark = self.enter_scope();
                let slot = self.alloc_local(param)?;
                for e in elems {
                    self.gen_expr(e, Dest::Var(slot))?;
                    for stmt in &body {
                        self.gen_expr(stmt, Dest::Discard)?;
                    }
                }
                self.exit_scope(mark);
                return self.finish_valueless(dest);
            }
        }

        // Table path: the structure must have become a length-prefixed
        // table; loop with inc_chk.
        let table = self
            .resolver
            .tables
            .ref_of(structure)
            .ok_or_else(|| self.err(format!("{name} needs a list or LTABLE structure")))?;
        let table_addr = Operand::constant(i32::from(self.resolver.table_addr(table)));
        let mark = self.enter_scope();
        let slot = self.alloc_local(param)?;
        let idx = self.scratch_local()?;
        let count = self.scratch_local()?;

        self.emit(Op::Loadw, &[table_addr, Operand::Small(0)], Some(count), None)?;
        self.emit(Op::Store, &[Operand::Small(idx), Operand::Small(0)], None, None)?;
        let start = self.cb.new_label();
        let end = self.cb.new_label();
        self.bind(start)?;
        self.emit(
            Op::IncChk,
            &[Operand::Small(idx), Operand::Variable(count)],
            None,
            Some((true, BranchTarget::Label(end))),
        )?;
        self.emit(
            Op::Loadw,
            &[table_addr, Operand::Variable(idx)],
            Some(slot),
            None,
        )?;
        for stmt in &body {
            self.gen_expr(stmt, Dest::Discard)?;
        }
        self.jump(start)?;
        self.bind(end)?;
        self.exit_scope(mark);
        self.finish_valueless(dest)
    }

    fn function_literal(
        &mut self,
        function: &Value,
    ) -> CompileResult<(zilc_frontend::intern::Atom, Vec<Value>)> {
        let inner = match function {
            Value::Quote(q) => q,
            other => other,
        };
        let Value::Form(items) = inner else {
            return Err(self.err("expected a FUNCTION literal"));
        };
        let is_fn = items
            .first()
            .and_then(Value::as_atom)
            .is_some_and(|a| self.name(a) == "FUNCTION");
        if !is_fn {
            return Err(self.err("expected a FUNCTION literal"));
        }
        let [_, Value::List(params), body @ ..] = items.as_slice() else {
            return Err(self.err("FUNCTION needs a parameter list"));
        };
        let [Value::Atom(param)] = params.as_slice() else {
            return Err(self.err("runtime map functions take exactly one parameter"));
        };
        Ok((*param, body.to_vec()))
    }

    // ----------------------------------------------------------------
    // Calls and TELL

    fn gen_call(
        &mut self,
        routine: &Value,
        args: &[Value],
        dest: Dest,
        check_arity: bool,
    ) -> CompileResult<()> {
        if check_arity {
            if let Some(a) = routine.as_atom() {
                if let Some(Sym::Routine(id)) = self.resolver.world.lookup(a) {
                    let def = &self.resolver.world.routines[id];
                    let min = def.required_count();
                    let max = min + def.optional_count();
                    if args.len() < min || args.len() > max {
                        return Err(self.err(format!(
                            "{} called with {} argument(s), expected {}",
                            self.name(a),
                            args.len(),
                            if min == max {
                                format!("{min}")
                            } else {
                                format!("{min}..{max}")
                            }
                        )));
                    }
                }
            }
        }
        if args.len() > self.version.max_call_args() {
            return Err(self.err(format!(
                "calls take at most {} arguments on {}",
                self.version.max_call_args(),
                self.version
            )));
        }

        let mut ops: SmallVec<[Operand; 4]> = SmallVec::new();
        ops.push(self.operand(routine)?);
        for a in args {
            ops.push(self.operand(a)?);
        }

        let void = dest == Dest::Discard && self.version >= ZVersion::V5;
        let op = match (args.len(), void) {
            (0, true) => Op::Call1n,
            (1, true) => Op::Call2n,
            (2..=3, true) => Op::CallVn,
            (_, true) => Op::CallVn2,
            (0, false) if self.version >= ZVersion::V4 => Op::Call1s,
            (1, false) if self.version >= ZVersion::V4 => Op::Call2s,
            (n, false) if n <= 3 => Op::CallVs,
            (_, false) => Op::CallVs2,
        };
        let info = op
            .info(self.version)
            .ok_or_else(|| self.err(format!("{op:?} unavailable on {}", self.version)))?;
        if info.store {
            self.emit_store_op(op, &ops, dest)
        } else {
            self.emit(op, &ops, None, None)
        }
    }

    fn gen_tell(&mut self, tokens: &[Value]) -> CompileResult<()> {
        let mut i = 0;
        while i < tokens.len() {
            let tok = &tokens[i];
            i += 1;
            match tok {
                Value::String(s) => {
                    let id = self.resolver.intern_string(s);
                    self.emit(
                        Op::PrintPaddr,
                        &[Operand::Ref(RefKind::TellString, id.as_u32())],
                        None,
                        None,
                    )?;
                }
                Value::Char(c) => {
                    self.emit(Op::PrintChar, &[Operand::Small(*c)], None, None)?;
                }
                Value::Atom(a) => {
                    let name = self.name(*a).to_owned();
                    match name.as_str() {
                        "CR" | "CRLF" => self.emit(Op::NewLine, &[], None, None)?,
                        "N" | "D" | "C" | "B" | "A" => {
                            let Some(arg) = tokens.get(i) else {
                                return Err(self.err(format!("TELL {name} needs a value")));
                            };
                            i += 1;
                            let o = self.operand(arg)?;
                            let op = match name.as_str() {
                                "N" => Op::PrintNum,
                                "D" | "A" => Op::PrintObj,
                                "C" => Op::PrintChar,
                                _ => Op::PrintAddr,
                            };
                            self.emit(op, &[o], None, None)?;
                        }
                        _ => {
                            // A bare value prints as a packed string.
                            let o = self.operand(tok)?;
                            self.emit(Op::PrintPaddr, &[o], None, None)?;
                        }
                    }
                }
                other => {
                    let o = self.operand(other)?;
                    self.emit(Op::PrintPaddr, &[o], None, None)?;
                }
            }
        }
        Ok(())
    }
}
