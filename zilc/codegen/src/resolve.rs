//! Immediate resolution: compile-time values to 16-bit operands.
//!
//! After phase-1 layout every data address (tables, dictionary words,
//! globals bases) is an ordinary constant; only routines and strings
//! resolve to placeholder references. One [`Resolver`] serves table
//! data, property data, global initializers and instruction operands.

use cranelift_entity::EntityRef;
use rustc_hash::FxHashMap;

use zilc_frontend::error::Location;
use zilc_frontend::intern::{Atom, Interner};
use zilc_frontend::value::Value;

use crate::fixup::{Imm, ImmResolver, RefKind};
use crate::result::{CompileError, CompileResult};
use crate::strings::StringTable;
use crate::symbols::{Sym, World};
use crate::tables::{TableId, TableSet};

pub struct Resolver<'a> {
    pub world: &'a World,
    pub interner: &'a mut Interner,
    pub strings: &'a mut StringTable,
    pub tables: &'a TableSet,
    /// Absolute address per table, fixed by layout.
    pub table_addrs: &'a [u16],
    /// Precomputed specials: `W?…`, `P?…`, `ACT?…`, `V?…` constants.
    pub special: &'a FxHashMap<Atom, Imm>,
    /// Constants resolved in declaration order.
    pub const_values: &'a [Imm],
    /// Globals whose initializer is a table; `,NAME` in static data
    /// resolves to the table address.
    pub global_tables: &'a FxHashMap<Atom, TableId>,
    /// Atoms with fixed meanings.
    pub atom_t: Atom,
    pub atom_gval: Atom,
    pub atom_lval: Atom,
}

impl<'a> Resolver<'a> {
    pub fn intern_string(&mut self, s: &str) -> crate::fixup::StringId {
        self.strings.intern(s)
    }

    pub fn table_addr(&self, id: TableId) -> u16 {
        self.table_addrs[id.index()]
    }

    fn undefined(&self, atom: Atom, loc: &Location) -> CompileError {
        CompileError::Semantic {
            loc: loc.clone(),
            message: format!("undefined atom {}", self.interner.name(atom)),
        }
    }

    fn resolve_atom(&mut self, atom: Atom, loc: &Location) -> CompileResult<Imm> {
        if atom == self.atom_t {
            return Ok(Imm::Const(1));
        }
        if let Some(&imm) = self.special.get(&atom) {
            return Ok(imm);
        }
        match self.world.lookup(atom) {
            Some(Sym::Object(n)) => Ok(Imm::Const(i32::from(n))),
            Some(Sym::Routine(id)) => Ok(Imm::Ref(RefKind::Routine, id.as_u32())),
            Some(Sym::Constant(i)) => {
                self.const_values.get(i as usize).copied().ok_or_else(|| {
                    CompileError::Semantic {
                        loc: loc.clone(),
                        message: format!(
                            "constant {} used before its definition",
                            self.interner.name(atom)
                        ),
                    }
                })
            }
            Some(Sym::Flag(f)) => Ok(Imm::Const(i32::from(f))),
            Some(Sym::Property(p)) => Ok(Imm::Const(i32::from(p))),
            Some(Sym::Global(_)) => Err(CompileError::Semantic {
                loc: loc.clone(),
                message: format!(
                    "global {} used where a constant value is required",
                    self.interner.name(atom)
                ),
            }),
            None => Err(self.undefined(atom, loc)),
        }
    }
}

impl<'a> ImmResolver for Resolver<'a> {
    fn resolve(&mut self, value: &Value, loc: &Location) -> CompileResult<Imm> {
        match value {
            Value::Int(n) => Ok(Imm::Const(*n)),
            Value::Char(c) => Ok(Imm::Const(i32::from(*c))),
            Value::Atom(a) => self.resolve_atom(*a, loc),
            Value::Quote(inner) => self.resolve(inner, loc),
            Value::String(s) => {
                let id = self.strings.intern(s);
                Ok(Imm::Ref(RefKind::StringOperand, id.as_u32()))
            }
            v if v.is_false() => Ok(Imm::Const(0)),
            Value::Form(items) => {
                if let Some(id) = self.tables.ref_of(value) {
                    return Ok(Imm::Const(i32::from(self.table_addr(id))));
                }
                let head = items.first().and_then(Value::as_atom);
                if head == Some(self.atom_gval) {
                    // `,NAME` in static data: legal only when NAME is a
                    // table-valued global or a constant.
                    if let Some(a) = items.get(1).and_then(Value::as_atom) {
                        if let Some(&t) = self.global_tables.get(&a) {
                            return Ok(Imm::Const(i32::from(self.table_addr(t))));
                        }
                        if matches!(self.world.lookup(a), Some(Sym::Constant(_))) {
                            return self.resolve_atom(a, loc);
                        }
                        return Err(CompileError::Semantic {
                            loc: loc.clone(),
                            message: format!(
                                "global {} used where a constant value is required",
                                self.interner.name(a)
                            ),
                        });
                    }
                    Err(CompileError::Semantic {
                        loc: loc.clone(),
                        message: "malformed GVAL in constant context".into(),
                    })
                } else if head == Some(self.atom_lval) {
                    Err(CompileError::Semantic {
                        loc: loc.clone(),
                        message: "local variable reference in constant context".into(),
                    })
                } else {
                    // Constant folding for the arithmetic that commonly
                    // appears in CONSTANT definitions.
                    let name = head.map(|h| self.interner.name(h).to_owned());
                    match name.as_deref() {
                        Some(op @ ("+" | "-" | "*" | "/" | "MOD")) => {
                            let mut acc: Option<i32> = None;
                            for item in &items[1..] {
                                let n = match self.resolve(item, loc)? {
                                    Imm::Const(n) => n,
                                    Imm::Ref(..) => {
                                        return Err(CompileError::Semantic {
                                            loc: loc.clone(),
                                            message:
                                                "cannot fold arithmetic over forward references"
                                                    .into(),
                                        })
                                    }
                                };
                                acc = Some(match acc {
                                    None => n,
                                    Some(a) => match op {
                                        "+" => a.wrapping_add(n),
                                        "-" => a.wrapping_sub(n),
                                        "*" => a.wrapping_mul(n),
                                        "/" if n != 0 => a.wrapping_div(n),
                                        "MOD" if n != 0 => a.wrapping_rem(n),
                                        _ => {
                                            return Err(CompileError::Semantic {
                                                loc: loc.clone(),
                                                message: "division by zero in constant".into(),
                                            })
                                        }
                                    },
                                });
                            }
                            Ok(Imm::Const(acc.unwrap_or(0)))
                        }
                        _ => Err(CompileError::Semantic {
                            loc: loc.clone(),
                            message: "expression is not a compile-time constant".into(),
                        }),
                    }
                }
            }
            _ => Err(CompileError::Semantic {
                loc: loc.clone(),
                message: "value has no 16-bit representation".into(),
            }),
        }
    }
}

/// Resolve every `CONSTANT` in declaration order; earlier constants are
/// visible to later ones.
pub fn resolve_constants(
    world: &World,
    interner: &mut Interner,
    strings: &mut StringTable,
    tables: &TableSet,
    table_addrs: &[u16],
    special: &FxHashMap<Atom, Imm>,
    global_tables: &FxHashMap<Atom, TableId>,
) -> CompileResult<Vec<Imm>> {
    let atom_t = interner.intern("T");
    let atom_gval = interner.intern("GVAL");
    let atom_lval = interner.intern("LVAL");
    let mut values: Vec<Imm> = Vec::with_capacity(world.constants.len());
    for i in 0..world.constants.len() {
        let def = world.constants[i].clone();
        let mut r = Resolver {
            world,
            interner,
            strings,
            tables,
            table_addrs,
            special,
            const_values: &values,
            global_tables,
            atom_t,
            atom_gval,
            atom_lval,
        };
        let imm = r.resolve(&def.value, &def.loc)?;
        values.push(imm);
    }
    Ok(values)
}
