//! Object table and property table emission.
//!
//! The object region is: property defaults, one entry per object
//! (attributes, parent/sibling/child, property-table pointer), then the
//! property tables. Property tables list properties in strictly
//! descending number order and end with a zero byte.
//!
//! Direction exits pack through PROPDEF patterns. User `PROPDEF`
//! declarations are tried in declaration order, first match wins;
//! absent a user pattern, the built-in UEXIT/FEXIT/NEXIT/CEXIT/DEXIT
//! shapes apply, each with a distinct data length so a game library can
//! tell them apart with `PTSIZE`.
//!
//! Planning happens before layout (sizes must be known to place later
//! regions); bytes are emitted after layout through the shared
//! immediate resolver.

use log::debug;
use rustc_hash::FxHashMap;

use zilc_frontend::error::Location;
use zilc_frontend::intern::{Atom, Interner};
use zilc_frontend::value::Value;
use zilc_zmachine::text::{encode, EncodeOpts};
use zilc_zmachine::ZVersion;

use crate::fixup::{Fixup, Imm, ImmResolver, RefKind, Region};
use crate::result::{CompileError, CompileResult, Diagnostics};
use crate::symbols::{Sym, World};
use crate::tables::ElemSize;

/// A property element after pattern interpretation.
enum PropValue {
    /// Resolved later through the shared immediate resolver.
    Value(Value),
    /// Known at planning time (pad bytes, object numbers, variable
    /// numbers).
    Raw(i32),
}

struct PlannedProp {
    id: u8,
    elems: Vec<(ElemSize, PropValue)>,
    loc: Location,
}

struct PlannedObject {
    attrs: Vec<u8>,
    parent: u16,
    short_name: Vec<u8>,
    props: Vec<PlannedProp>,
}

pub struct ObjectRegion {
    version: ZVersion,
    objects: Vec<PlannedObject>,
}

/// Interpret every object: attributes, containment, short name, and
/// property data shapes.
pub fn plan(
    world: &World,
    interner: &mut Interner,
    text_opts: &EncodeOpts,
    diag: &mut Diagnostics,
) -> CompileResult<ObjectRegion> {
    let mut planner = Planner {
        version: world.version,
        text_opts: *text_opts,
        flags_head: interner.intern("FLAGS"),
        desc_head: interner.intern("DESC"),
        in_head: interner.intern("IN"),
        loc_head: interner.intern("LOC"),
        synonym_head: interner.intern("SYNONYM"),
        adjective_head: interner.intern("ADJECTIVE"),
        to: interner.intern("TO"),
        per: interner.intern("PER"),
        sorry: interner.intern("SORRY"),
        if_: interner.intern("IF"),
        is: interner.intern("IS"),
        else_: interner.intern("ELSE"),
        byte_head: interner.intern("BYTE"),
        word_head: interner.intern("WORD"),
        eq: interner.intern("="),
        opt_marker: interner.intern("OPT"),
    };

    let mut objects = Vec::with_capacity(world.objects.len());
    for def in &world.objects {
        objects.push(planner.plan_object(world, interner, def, diag)?);
    }
    debug!("planned {} object(s)", objects.len());
    Ok(ObjectRegion { version: world.version, objects })
}

struct Planner {
    version: ZVersion,
    text_opts: EncodeOpts,
    flags_head: Atom,
    desc_head: Atom,
    in_head: Atom,
    loc_head: Atom,
    synonym_head: Atom,
    adjective_head: Atom,
    to: Atom,
    per: Atom,
    sorry: Atom,
    if_: Atom,
    is: Atom,
    else_: Atom,
    byte_head: Atom,
    word_head: Atom,
    eq: Atom,
    opt_marker: Atom,
}

impl Planner {
    fn obj_size(&self) -> ElemSize {
        if self.version == ZVersion::V3 {
            ElemSize::Byte
        } else {
            ElemSize::Word
        }
    }

    fn plan_object(
        &mut self,
        world: &World,
        interner: &mut Interner,
        def: &zilc_frontend::decl::ObjectDef,
        diag: &mut Diagnostics,
    ) -> CompileResult<PlannedObject> {
        let loc = &def.loc;
        let mut attrs = vec![0u8; self.version.attr_bytes()];
        let mut parent = 0u16;
        let mut short_name = Vec::new();
        let mut props: Vec<PlannedProp> = Vec::new();

        for (head, values) in &def.props {
            if *head == self.flags_head {
                for v in values {
                    let flag = v.as_atom().and_then(|a| world.flag_id(a)).ok_or_else(|| {
                        CompileError::Semantic {
                            loc: loc.clone(),
                            message: "unregistered flag in FLAGS list".into(),
                        }
                    })?;
                    // Attribute 0 is the top bit of the first byte.
                    attrs[usize::from(flag) / 8] |= 0x80 >> (flag % 8);
                }
                continue;
            }
            if *head == self.desc_head {
                let Some(Value::String(s)) = values.first() else {
                    return Err(CompileError::Semantic {
                        loc: loc.clone(),
                        message: "DESC needs a string".into(),
                    });
                };
                short_name = encode(s, self.version, None, &self.text_opts)
                    .map_err(|source| CompileError::Encoding { loc: loc.clone(), source })?;
                continue;
            }
            if (*head == self.in_head || *head == self.loc_head)
                && matches!(values[..], [Value::Atom(a)] if world.object_number(a).is_some())
            {
                let Some(Value::Atom(a)) = values.first() else { unreachable!() };
                parent = world.object_number(*a).unwrap();
                continue;
            }

            let id = world.property_id(*head).ok_or_else(|| CompileError::Semantic {
                loc: loc.clone(),
                message: format!("{} is not a property", interner.name(*head)),
            })?;
            if props.iter().any(|p| p.id == id) {
                return Err(CompileError::Semantic {
                    loc: loc.clone(),
                    message: format!("duplicate property {} on object", interner.name(*head)),
                });
            }

            let elems = self.plan_prop(world, interner, *head, values, loc, diag)?;
            props.push(PlannedProp { id, elems, loc: loc.clone() });
        }

        // Descending property-number order.
        props.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(PlannedObject { attrs, parent, short_name, props })
    }

    fn plan_prop(
        &mut self,
        world: &World,
        interner: &mut Interner,
        head: Atom,
        values: &[Value],
        loc: &Location,
        diag: &mut Diagnostics,
    ) -> CompileResult<Vec<(ElemSize, PropValue)>> {
        // Vocabulary properties hold dictionary word addresses.
        if head == self.synonym_head || head == self.adjective_head {
            let mut elems = Vec::with_capacity(values.len());
            for v in values {
                let Some(w) = v.as_atom() else {
                    return Err(CompileError::Semantic {
                        loc: loc.clone(),
                        message: "vocabulary property entries must be atoms".into(),
                    });
                };
                let wref = interner.intern(&format!("W?{}", interner.name(w).to_owned()));
                elems.push((ElemSize::Word, PropValue::Value(Value::Atom(wref))));
            }
            return Ok(elems);
        }

        // User PROPDEF patterns, declaration order, first match wins.
        if let Some(propdef) = world.propdefs.get(&head) {
            let patterns = propdef.patterns.clone();
            for clause in &patterns {
                if let Some(elems) = self.match_pattern(world, interner, clause, values, loc)? {
                    return Ok(elems);
                }
            }
            if !patterns.is_empty() {
                diag.warn(
                    Some(loc.clone()),
                    format!(
                        "no PROPDEF pattern of {} matches; storing values verbatim",
                        interner.name(head)
                    ),
                )?;
            }
        } else if world.is_direction(head) {
            if let Some(elems) = self.plan_exit(world, interner, values, loc)? {
                return Ok(elems);
            }
        }

        // The general case: one word (or marked byte) per value.
        let mut elems = Vec::with_capacity(values.len());
        for v in values {
            if let Some(inner) = v.form_args(self.byte_head).and_then(<[Value]>::first) {
                elems.push((ElemSize::Byte, PropValue::Value(inner.clone())));
            } else if let Some(inner) = v.form_args(self.word_head).and_then(<[Value]>::first) {
                elems.push((ElemSize::Word, PropValue::Value(inner.clone())));
            } else {
                elems.push((ElemSize::Word, PropValue::Value(v.clone())));
            }
        }
        Ok(elems)
    }

    /// The built-in exit shapes.
    fn plan_exit(
        &mut self,
        world: &World,
        interner: &mut Interner,
        values: &[Value],
        loc: &Location,
    ) -> CompileResult<Option<Vec<(ElemSize, PropValue)>>> {
        let obj = self.obj_size();
        let object_num = |a: Atom| -> CompileResult<i32> {
            world.object_number(a).map(i32::from).ok_or_else(|| CompileError::Semantic {
                loc: loc.clone(),
                message: format!("exit to undefined room {}", interner.name(a)),
            })
        };
        let atom = |v: &Value| v.as_atom();

        match values {
            // UEXIT: (DIR TO room)
            [Value::Atom(kw), Value::Atom(room)] if *kw == self.to => {
                Ok(Some(vec![(obj, PropValue::Raw(object_num(*room)?))]))
            }
            // FEXIT: (DIR PER routine)
            [Value::Atom(kw), Value::Atom(routine)] if *kw == self.per => {
                let mut elems =
                    vec![(ElemSize::Word, PropValue::Value(Value::Atom(*routine)))];
                if self.version != ZVersion::V3 {
                    elems.push((ElemSize::Byte, PropValue::Raw(0)));
                }
                Ok(Some(elems))
            }
            // NEXIT: (DIR SORRY "message")
            [Value::Atom(kw), Value::String(s)] if *kw == self.sorry => {
                let mut elems =
                    vec![(ElemSize::Word, PropValue::Value(Value::String(s.clone())))];
                elems.push((ElemSize::Byte, PropValue::Raw(0)));
                if self.version != ZVersion::V3 {
                    elems.push((ElemSize::Byte, PropValue::Raw(0)));
                }
                Ok(Some(elems))
            }
            // CEXIT/DEXIT: (DIR TO room IF cond [IS OPEN] [ELSE "msg"])
            [Value::Atom(kw), Value::Atom(room), Value::Atom(if_), rest @ ..]
                if *kw == self.to && *if_ == self.if_ =>
            {
                let Some(cond) = rest.first().and_then(atom) else {
                    return Err(CompileError::Semantic {
                        loc: loc.clone(),
                        message: "conditional exit needs a flag global or a door".into(),
                    });
                };
                let mut tail = &rest[1..];
                if let [Value::Atom(is), Value::Atom(_open), t @ ..] = tail {
                    if *is == self.is {
                        tail = t;
                    }
                }
                let msg = match tail {
                    [Value::Atom(els), Value::String(s)] if *els == self.else_ => {
                        Some(s.clone())
                    }
                    [] => None,
                    _ => {
                        return Err(CompileError::Semantic {
                            loc: loc.clone(),
                            message: "malformed conditional exit".into(),
                        })
                    }
                };
                let msg_elem = match msg {
                    Some(s) => (ElemSize::Word, PropValue::Value(Value::String(s))),
                    None => (ElemSize::Word, PropValue::Raw(0)),
                };

                if let Some(door) = world.object_number(cond) {
                    // DEXIT
                    let mut elems = vec![
                        (obj, PropValue::Raw(object_num(*room)?)),
                        (obj, PropValue::Raw(i32::from(door))),
                        msg_elem,
                    ];
                    if self.version == ZVersion::V3 {
                        elems.push((ElemSize::Byte, PropValue::Raw(0)));
                    }
                    Ok(Some(elems))
                } else if let Some(Sym::Global(var)) = world.lookup(cond) {
                    // CEXIT
                    Ok(Some(vec![
                        (obj, PropValue::Raw(object_num(*room)?)),
                        (ElemSize::Byte, PropValue::Raw(i32::from(var))),
                        msg_elem,
                    ]))
                } else {
                    Err(CompileError::Semantic {
                        loc: loc.clone(),
                        message: format!(
                            "conditional exit tests {}, which is neither global nor door",
                            interner.name(cond)
                        ),
                    })
                }
            }
            _ => Ok(None),
        }
    }

    /// One user PROPDEF pattern clause against one value list.
    /// Clause shape: `(NAME template… = output…)`.
    fn match_pattern(
        &mut self,
        world: &World,
        interner: &mut Interner,
        clause: &Value,
        values: &[Value],
        loc: &Location,
    ) -> CompileResult<Option<Vec<(ElemSize, PropValue)>>> {
        let Value::List(items) = clause else { return Ok(None) };
        let Some(eq_at) = items.iter().position(|v| v.as_atom() == Some(self.eq)) else {
            return Ok(None);
        };
        let (template, output) = (&items[1..eq_at], &items[eq_at + 1..]);

        // Bind template items against the values.
        let mut bindings: FxHashMap<Atom, Value> = FxHashMap::default();
        let mut vi = 0usize;
        let mut optional = false;
        for t in template {
            match t {
                Value::String(_) => optional = true,
                Value::Atom(a) if *a == self.opt_marker => optional = true,
                Value::Atom(a) => {
                    let name = interner.name(*a).to_owned();
                    match name.split_once(':') {
                        Some((var, ty)) => {
                            let Some(v) = values.get(vi) else {
                                if optional {
                                    continue;
                                }
                                return Ok(None);
                            };
                            if !type_matches(world, ty, v) {
                                return Ok(None);
                            }
                            bindings.insert(interner.intern(var), v.clone());
                            vi += 1;
                        }
                        None => {
                            // Literal keyword.
                            if values.get(vi).and_then(Value::as_atom) != Some(*a) {
                                if optional {
                                    continue;
                                }
                                return Ok(None);
                            }
                            vi += 1;
                        }
                    }
                }
                _ => return Ok(None),
            }
        }
        if vi != values.len() {
            return Ok(None);
        }

        // Interpret the output specs.
        let mut elems = Vec::new();
        for o in output {
            match o {
                Value::Int(n) => elems.push((ElemSize::Word, PropValue::Raw(*n))),
                Value::Form(spec) | Value::List(spec) => {
                    let Some(op) = spec.first().and_then(Value::as_atom) else { continue };
                    let arg = spec.get(1);
                    let lookup = |bindings: &FxHashMap<Atom, Value>| {
                        arg.and_then(Value::as_atom)
                            .and_then(|a| bindings.get(&a).cloned())
                            .or_else(|| arg.cloned())
                    };
                    match interner.name(op) {
                        "BYTE" => match lookup(&bindings) {
                            Some(Value::Int(n)) => {
                                elems.push((ElemSize::Byte, PropValue::Raw(n)))
                            }
                            Some(v) => elems.push((ElemSize::Byte, PropValue::Value(v))),
                            None => elems.push((ElemSize::Byte, PropValue::Raw(0))),
                        },
                        "WORD" => match lookup(&bindings) {
                            Some(v) => elems.push((ElemSize::Word, PropValue::Value(v))),
                            None => elems.push((ElemSize::Word, PropValue::Raw(0))),
                        },
                        "ROOM" | "OBJECT" => {
                            let Some(Value::Atom(a)) = lookup(&bindings) else {
                                return Err(CompileError::Semantic {
                                    loc: loc.clone(),
                                    message: "pattern ROOM slot needs an object".into(),
                                });
                            };
                            let n = world.object_number(a).ok_or_else(|| {
                                CompileError::Semantic {
                                    loc: loc.clone(),
                                    message: format!(
                                        "pattern references undefined object {}",
                                        interner.name(a)
                                    ),
                                }
                            })?;
                            elems.push((self.obj_size(), PropValue::Raw(i32::from(n))));
                        }
                        "GLOBAL" => {
                            let Some(Value::Atom(a)) = lookup(&bindings) else {
                                return Err(CompileError::Semantic {
                                    loc: loc.clone(),
                                    message: "pattern GLOBAL slot needs a global".into(),
                                });
                            };
                            let Some(Sym::Global(var)) = world.lookup(a) else {
                                return Err(CompileError::Semantic {
                                    loc: loc.clone(),
                                    message: format!(
                                        "pattern references undefined global {}",
                                        interner.name(a)
                                    ),
                                });
                            };
                            elems.push((ElemSize::Byte, PropValue::Raw(i32::from(var))));
                        }
                        "STRING" | "ROUTINE" => match lookup(&bindings) {
                            Some(v) => elems.push((ElemSize::Word, PropValue::Value(v))),
                            None => elems.push((ElemSize::Word, PropValue::Raw(0))),
                        },
                        "VOC" => {
                            if let Some(Value::Atom(w)) = lookup(&bindings) {
                                let name = interner.name(w).to_owned();
                                let wref = interner.intern(&format!("W?{name}"));
                                elems.push((
                                    ElemSize::Word,
                                    PropValue::Value(Value::Atom(wref)),
                                ));
                            }
                        }
                        // Tag lists like (UEXIT 1) carry no data.
                        _ => {}
                    }
                }
                Value::Atom(a) => {
                    if let Some(v) = bindings.get(a) {
                        elems.push((ElemSize::Word, PropValue::Value(v.clone())));
                    }
                }
                _ => {}
            }
        }
        Ok(Some(elems))
    }
}

fn type_matches(world: &World, ty: &str, v: &Value) -> bool {
    match ty {
        "ROOM" | "OBJECT" => v.as_atom().is_some_and(|a| world.object_number(a).is_some()),
        "FCN" | "ROUTINE" => v.as_atom().is_some(),
        "GLOBAL" | "VAR" => v.as_atom().is_some_and(|a| matches!(world.lookup(a), Some(Sym::Global(_)))),
        "STR" | "STRING" => matches!(v, Value::String(_)),
        "FIX" | "NUMBER" => matches!(v, Value::Int(_)),
        "VOC" | "ATOM" | "ANY" => true,
        _ => true,
    }
}

impl ObjectRegion {
    pub fn defaults_size(&self) -> u32 {
        u32::from(self.version.max_property()) * 2
    }

    pub fn entries_size(&self) -> u32 {
        (self.objects.len() * self.version.obj_entry_size()) as u32
    }

    fn prop_table_size(&self, object: usize) -> u32 {
        let o = &self.objects[object];
        let mut size = 1 + o.short_name.len() as u32;
        for prop in &o.props {
            let data: u32 = prop.elems.iter().map(|(s, _)| s.bytes()).sum();
            let hdr = if self.version == ZVersion::V3 || data <= 2 { 1 } else { 2 };
            size += hdr + data;
        }
        size + 1
    }

    pub fn byte_size(&self) -> u32 {
        self.defaults_size()
            + self.entries_size()
            + (0..self.objects.len()).map(|i| self.prop_table_size(i)).sum::<u32>()
    }

    /// Emit the region. `base` is the object table's absolute address.
    pub fn emit(
        &self,
        base: u16,
        world: &World,
        resolver: &mut dyn ImmResolver,
        fixups: &mut Vec<Fixup>,
    ) -> CompileResult<Vec<u8>> {
        let count = self.objects.len();
        let mut out = Vec::with_capacity(self.byte_size() as usize);

        // Property defaults: PROPDEF defaults where given, zero
        // otherwise. Resolved in property-number order so string
        // interning stays deterministic.
        let mut defaults = vec![0u16; self.version.max_property() as usize];
        let mut with_defaults: Vec<(u8, &zilc_frontend::decl::PropdefDef)> = world
            .propdefs
            .values()
            .filter(|def| def.default.is_some())
            .filter_map(|def| match world.lookup(def.name) {
                Some(Sym::Property(id)) => Some((id, def)),
                _ => None,
            })
            .collect();
        with_defaults.sort_by_key(|&(id, _)| id);
        for (id, def) in with_defaults {
            let default = def.default.as_ref().unwrap();
            match resolver.resolve(default, &def.loc)? {
                Imm::Const(c) => defaults[usize::from(id) - 1] = c as u16,
                Imm::Ref(..) => {
                    return Err(CompileError::Semantic {
                        loc: def.loc.clone(),
                        message: "property defaults must be constants".into(),
                    })
                }
            }
        }
        for d in defaults {
            out.extend_from_slice(&d.to_be_bytes());
        }

        // Entries, with property-table addresses precomputed from the
        // planned sizes.
        let mut prop_addr = u32::from(base) + self.defaults_size() + self.entries_size();
        let mut prop_addrs = Vec::with_capacity(count);
        for i in 0..count {
            prop_addrs.push(prop_addr as u16);
            prop_addr += self.prop_table_size(i);
        }

        let links = self.family_links();
        for (i, o) in self.objects.iter().enumerate() {
            out.extend_from_slice(&o.attrs);
            let (parent, sibling, child) = links[i];
            if self.version.obj_link_is_byte() {
                out.push(parent as u8);
                out.push(sibling as u8);
                out.push(child as u8);
            } else {
                out.extend_from_slice(&parent.to_be_bytes());
                out.extend_from_slice(&sibling.to_be_bytes());
                out.extend_from_slice(&child.to_be_bytes());
            }
            out.extend_from_slice(&prop_addrs[i].to_be_bytes());
        }

        // Property tables.
        for (i, o) in self.objects.iter().enumerate() {
            debug_assert_eq!(u32::from(base) + out.len() as u32, u32::from(prop_addrs[i]));
            out.push((o.short_name.len() / 2) as u8);
            out.extend_from_slice(&o.short_name);
            for prop in &o.props {
                let data: u32 = prop.elems.iter().map(|(s, _)| s.bytes()).sum();
                self.push_size_bytes(&mut out, prop, data)?;
                for (size, elem) in &prop.elems {
                    let imm = match elem {
                        PropValue::Raw(n) => Imm::Const(*n),
                        PropValue::Value(v) => match resolver.resolve(v, &prop.loc)? {
                            // Routine references in property data use
                            // their own placeholder range.
                            Imm::Ref(RefKind::Routine, idx) => Imm::Ref(RefKind::PropRoutine, idx),
                            other => other,
                        },
                    };
                    match (imm, size) {
                        (Imm::Const(c), ElemSize::Byte) => out.push(c as u8),
                        (Imm::Const(c), ElemSize::Word) => {
                            out.extend_from_slice(&(c as u16).to_be_bytes())
                        }
                        (Imm::Ref(kind, index), ElemSize::Word) => {
                            fixups.push(Fixup {
                                region: Region::ObjectProps,
                                offset: out.len() as u32,
                                kind,
                                index,
                            });
                            out.extend_from_slice(&kind.placeholder(index).to_be_bytes());
                        }
                        (Imm::Ref(..), ElemSize::Byte) => {
                            return Err(CompileError::Semantic {
                                loc: prop.loc.clone(),
                                message: "reference value cannot fit a byte property slot".into(),
                            })
                        }
                    }
                }
            }
            out.push(0);
        }

        debug_assert_eq!(out.len() as u32, self.byte_size());
        Ok(out)
    }

    fn push_size_bytes(&self, out: &mut Vec<u8>, prop: &PlannedProp, data: u32) -> CompileResult<()> {
        if data as usize > self.version.max_prop_len() || data == 0 {
            return Err(CompileError::Semantic {
                loc: prop.loc.clone(),
                message: format!(
                    "property {} has {} data bytes (limit {})",
                    prop.id,
                    data,
                    self.version.max_prop_len()
                ),
            });
        }
        if self.version == ZVersion::V3 {
            out.push(((data as u8 - 1) << 5) | prop.id);
        } else if data <= 2 {
            out.push((((data == 2) as u8) << 6) | prop.id);
        } else {
            out.push(0x80 | prop.id);
            out.push(0x80 | (data as u8 & 0x3F));
        }
        Ok(())
    }

    /// Parent/sibling/child links, children in definition order.
    fn family_links(&self) -> Vec<(u16, u16, u16)> {
        let count = self.objects.len();
        let mut sibling = vec![0u16; count];
        let mut first_child = vec![0u16; count];
        let mut last_child_of: FxHashMap<u16, usize> = FxHashMap::default();

        // Numbering order is reversed definition order, so walk
        // backwards to see children as they were defined.
        for i in (0..count).rev() {
            let p = self.objects[i].parent;
            if p == 0 {
                continue;
            }
            match last_child_of.get(&p) {
                None => first_child[(p - 1) as usize] = (i + 1) as u16,
                Some(&prev) => sibling[prev] = (i + 1) as u16,
            }
            last_child_of.insert(p, i);
        }
        (0..count)
            .map(|i| (self.objects[i].parent, sibling[i], first_child[i]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixup::Imm;
    use crate::result::Diagnostics;
    use crate::symbols::World;
    use zilc_frontend::decl::recognize;
    use zilc_frontend::expand::Expander;
    use zilc_frontend::parser::Parser;
    use zilc_frontend::preprocess::SourceMap;

    fn region(src: &str, version: ZVersion) -> (ObjectRegion, World, Interner) {
        let map = SourceMap::single_file("t.zil", src);
        let mut interner = Interner::new();
        let tops = Parser::new(src, &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        let tops = Expander::new(&mut interner).expand_program(tops, &map).unwrap();
        let program = recognize(tops, &mut interner, &map).unwrap();
        let mut diag = Diagnostics::new(100);
        let world = crate::symbols::build(&program, version, &mut interner, &mut diag).unwrap();
        let opts = EncodeOpts::default();
        let r = plan(&world, &mut interner, &opts, &mut diag).unwrap();
        (r, world, interner)
    }

    /// Resolves atoms through the world only; no strings or tables.
    struct BareResolver<'a>(&'a World);
    impl ImmResolver for BareResolver<'_> {
        fn resolve(&mut self, v: &Value, loc: &Location) -> CompileResult<Imm> {
            match v {
                Value::Int(n) => Ok(Imm::Const(*n)),
                Value::Atom(a) => match self.0.lookup(*a) {
                    Some(Sym::Object(n)) => Ok(Imm::Const(i32::from(n))),
                    Some(Sym::Routine(id)) => Ok(Imm::Ref(RefKind::Routine, id.as_u32())),
                    _ => Err(CompileError::Semantic {
                        loc: loc.clone(),
                        message: "unresolvable in test".into(),
                    }),
                },
                Value::String(_) => Ok(Imm::Ref(RefKind::StringOperand, 0)),
                _ => Err(CompileError::Semantic {
                    loc: loc.clone(),
                    message: "unresolvable in test".into(),
                }),
            }
        }
    }

    #[test]
    fn children_link_in_definition_order() {
        let (r, _, _) = region(
            "<OBJECT BOX (DESC \"box\")> \
             <OBJECT COIN (IN BOX)> \
             <OBJECT GEM (IN BOX)>",
            ZVersion::V3,
        );
        // Numbering is reversed: GEM=1, COIN=2, BOX=3.
        let links = r.family_links();
        // BOX's first child is COIN (defined first), then GEM.
        assert_eq!(links[2], (0, 0, 2));
        assert_eq!(links[1], (3, 1, 0)); // COIN: parent BOX, sibling GEM
        assert_eq!(links[0], (3, 0, 0)); // GEM: parent BOX, last child
    }

    #[test]
    fn exit_shapes_have_distinct_lengths() {
        let (r, world, _) = region(
            "<DIRECTIONS NORTH SOUTH EAST WEST> \
             <GLOBAL DOOR-OPEN 0> \
             <ROUTINE EXIT-FCN () <RTRUE>> \
             <OBJECT HALL (DESC \"hall\")> \
             <OBJECT DEN (DESC \"den\") \
               (NORTH TO HALL) \
               (SOUTH PER EXIT-FCN) \
               (EAST SORRY \"No.\") \
               (WEST TO HALL IF DOOR-OPEN ELSE \"Closed.\")>",
            ZVersion::V3,
        );
        let mut fixups = Vec::new();
        let bytes = r
            .emit(0x100, &world, &mut BareResolver(&world), &mut fixups)
            .unwrap();
        // Walk DEN's property table: exits in descending direction
        // order are NORTH(31)=1, SOUTH(30)=2, EAST(29)=3, WEST(28)=4
        // data bytes under the V3 size-byte encoding.
        let den_entry = r.defaults_size() as usize + 0; // object 1 = DEN
        let prop_addr =
            usize::from(u16::from_be_bytes([bytes[den_entry + 7], bytes[den_entry + 8]])) - 0x100;
        let mut at = prop_addr;
        at += 1 + usize::from(bytes[at]) * 2; // skip short name
        let mut lens = Vec::new();
        while bytes[at] != 0 {
            let size = bytes[at];
            let len = usize::from(size >> 5) + 1;
            lens.push((size & 0x1F, len));
            at += 1 + len;
        }
        assert_eq!(lens, vec![(31, 1), (30, 2), (29, 3), (28, 4)]);
        // The FEXIT routine became a property-routine fixup.
        assert!(fixups.iter().any(|f| f.kind == RefKind::PropRoutine));
    }

    #[test]
    fn v4_uses_two_byte_size_headers_for_long_props() {
        let (r, world, _) = region(
            "<OBJECT THING (DESC \"thing\") (STUFF 1 2 3)>",
            ZVersion::V4,
        );
        let mut fixups = Vec::new();
        let bytes = r
            .emit(0x100, &world, &mut BareResolver(&world), &mut fixups)
            .unwrap();
        let entry = r.defaults_size() as usize;
        let prop_addr =
            usize::from(u16::from_be_bytes([bytes[entry + 12], bytes[entry + 13]])) - 0x100;
        let mut at = prop_addr;
        at += 1 + usize::from(bytes[at]) * 2;
        // Three words of data: two-byte header, bit 7 set in both.
        assert_eq!(bytes[at] & 0x80, 0x80);
        assert_eq!(bytes[at + 1], 0x80 | 6);
    }

    #[test]
    fn propdef_patterns_match_in_order() {
        let (r, world, _) = region(
            "<PROPDEF HEIGHT 0 (HEIGHT N:NUMBER = (BYTE N)) (HEIGHT S:STRING = (STRING S))> \
             <OBJECT POLE (DESC \"pole\") (HEIGHT 12)>",
            ZVersion::V3,
        );
        let mut fixups = Vec::new();
        let bytes = r
            .emit(0x100, &world, &mut BareResolver(&world), &mut fixups)
            .unwrap();
        let entry = r.defaults_size() as usize;
        let prop_addr =
            usize::from(u16::from_be_bytes([bytes[entry + 7], bytes[entry + 8]])) - 0x100;
        let mut at = prop_addr;
        at += 1 + usize::from(bytes[at]) * 2;
        // One byte of data holding 12.
        assert_eq!(usize::from(bytes[at] >> 5) + 1, 1);
        assert_eq!(bytes[at + 1], 12);
    }
}
