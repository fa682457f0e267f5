//! User table lowering: `TABLE`, `ITABLE`, `LTABLE`, `PTABLE`.
//!
//! Tables are collected in one pre-pass that rewrites each table form
//! into an opaque `<%TABLE% n>` reference, innermost first, so that a
//! table's stored elements refer to already-collected children. Sizes
//! are computable without any addresses; contents are emitted after
//! layout has fixed every data base.

use cranelift_entity::{entity_impl, PrimaryMap};
use log::debug;

use zilc_frontend::decl::Program;
use zilc_frontend::error::Location;
use zilc_frontend::intern::{Atom, Interner};
use zilc_frontend::value::Value;

use crate::fixup::{Fixup, Imm, ImmResolver, Region};
use crate::result::{CompileError, CompileResult};

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(u32);
entity_impl!(TableId, "table");

/// Head atom of the opaque reference left where a table form was.
pub const TABLE_REF_NAME: &str = "%TABLE%";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElemSize {
    Byte,
    Word,
}

impl ElemSize {
    pub(crate) fn bytes(self) -> u32 {
        match self {
            ElemSize::Byte => 1,
            ElemSize::Word => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Table {
    pub elem: ElemSize,
    pub pure: bool,
    /// Prefix the data with the element count (LTABLE).
    pub length_prefix: bool,
    /// Per-element size overrides; the last entry repeats.
    pub pattern: Vec<ElemSize>,
    pub elements: Vec<Value>,
    pub loc: Location,
}

impl Table {
    fn elem_size(&self, index: usize) -> ElemSize {
        if self.pattern.is_empty() {
            self.elem
        } else {
            *self.pattern.get(index).unwrap_or(self.pattern.last().unwrap())
        }
    }

    /// Total size in bytes, addresses not required.
    pub fn byte_size(&self, byte_marker: Atom, word_marker: Atom) -> u32 {
        let mut size = if self.length_prefix { self.elem.bytes() } else { 0 };
        for (i, e) in self.elements.iter().enumerate() {
            size += self.element_size(i, e, byte_marker, word_marker).bytes();
        }
        size
    }

    fn element_size(&self, i: usize, e: &Value, byte_marker: Atom, word_marker: Atom) -> ElemSize {
        // An explicit #BYTE / #WORD wrapper overrides table sizing.
        if e.form_args(byte_marker).is_some() {
            return ElemSize::Byte;
        }
        if e.form_args(word_marker).is_some() {
            return ElemSize::Word;
        }
        self.elem_size(i)
    }
}

pub struct TableSet {
    tables: PrimaryMap<TableId, Table>,
    marker: Atom,
    byte_marker: Atom,
    word_marker: Atom,
}

impl TableSet {
    pub fn get(&self, id: TableId) -> &Table {
        &self.tables[id]
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.tables.iter()
    }

    /// The `<%TABLE% n>` reference this value carries, if any.
    pub fn ref_of(&self, value: &Value) -> Option<TableId> {
        let args = value.form_args(self.marker)?;
        match args {
            [Value::Int(n)] => Some(TableId::from_u32(*n as u32)),
            _ => None,
        }
    }

    pub fn size_of(&self, id: TableId) -> u32 {
        self.tables[id].byte_size(self.byte_marker, self.word_marker)
    }

    /// Emit one table's bytes. `region` decides where fixups point.
    pub fn emit(
        &self,
        id: TableId,
        region: Region,
        region_offset: u32,
        resolver: &mut dyn ImmResolver,
        fixups: &mut Vec<Fixup>,
    ) -> CompileResult<Vec<u8>> {
        let table = &self.tables[id];
        let mut out = Vec::with_capacity(self.size_of(id) as usize);
        if table.length_prefix {
            let count = table.elements.len() as u32;
            match table.elem {
                ElemSize::Byte => out.push(count as u8),
                ElemSize::Word => out.extend_from_slice(&(count as u16).to_be_bytes()),
            }
        }
        for (i, element) in table.elements.iter().enumerate() {
            let size = table.element_size(i, element, self.byte_marker, self.word_marker);
            // Unwrap explicit size markers before resolving.
            let inner = element
                .form_args(self.byte_marker)
                .or_else(|| element.form_args(self.word_marker))
                .and_then(<[Value]>::first)
                .unwrap_or(element);
            let imm = resolver.resolve(inner, &table.loc)?;
            match (imm, size) {
                (Imm::Const(c), ElemSize::Byte) => out.push(c as u8),
                (Imm::Const(c), ElemSize::Word) => {
                    out.extend_from_slice(&(c as u16).to_be_bytes())
                }
                (Imm::Ref(kind, index), ElemSize::Word) => {
                    fixups.push(Fixup {
                        region,
                        offset: region_offset + out.len() as u32,
                        kind,
                        index,
                    });
                    out.extend_from_slice(&kind.placeholder(index).to_be_bytes());
                }
                (Imm::Ref(..), ElemSize::Byte) => {
                    return Err(CompileError::Semantic {
                        loc: table.loc.clone(),
                        message: "a routine or string reference cannot fit a byte element"
                            .into(),
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Walk the whole program, replacing table forms with references.
pub fn collect(program: &mut Program, interner: &mut Interner) -> CompileResult<TableSet> {
    let mut c = Collector {
        set: TableSet {
            tables: PrimaryMap::new(),
            marker: interner.intern(TABLE_REF_NAME),
            byte_marker: interner.intern("BYTE"),
            word_marker: interner.intern("WORD"),
        },
        table_heads: [
            interner.intern("TABLE"),
            interner.intern("ITABLE"),
            interner.intern("LTABLE"),
            interner.intern("PTABLE"),
        ],
        map_heads: [interner.intern("MAPF"), interner.intern("MAPR")],
        flag_atoms: FlagAtoms {
            byte: interner.intern("BYTE"),
            word: interner.intern("WORD"),
            pure: interner.intern("PURE"),
            length: interner.intern("LENGTH"),
            none: interner.intern("NONE"),
            pattern: interner.intern("PATTERN"),
        },
    };

    for def in &mut program.globals {
        let loc = def.loc.clone();
        c.walk(&mut def.value, &loc)?;
    }
    for def in &mut program.constants {
        let loc = def.loc.clone();
        c.walk(&mut def.value, &loc)?;
    }
    for def in &mut program.objects {
        let loc = def.loc.clone();
        for (_, values) in &mut def.props {
            for v in values {
                c.walk(v, &loc)?;
            }
        }
    }
    for def in &mut program.routines {
        let loc = def.loc.clone();
        for v in &mut def.body {
            c.walk(v, &loc)?;
        }
    }
    debug!("collected {} table(s)", c.set.len());
    Ok(c.set)
}

struct FlagAtoms {
    byte: Atom,
    word: Atom,
    pure: Atom,
    length: Atom,
    none: Atom,
    pattern: Atom,
}

struct Collector {
    set: TableSet,
    table_heads: [Atom; 4],
    map_heads: [Atom; 2],
    flag_atoms: FlagAtoms,
}

impl Collector {
    fn walk(&mut self, value: &mut Value, loc: &Location) -> CompileResult<()> {
        // Children first, so a table's stored elements already carry
        // references to their own nested tables.
        match value {
            Value::Form(items)
            | Value::List(items)
            | Value::Vector(items)
            | Value::Splice(items) => {
                for item in items.iter_mut() {
                    self.walk(item, loc)?;
                }
            }
            _ => {}
        }
        // A runtime MAPF/MAPR over a big literal list cannot unroll;
        // lower the list to an anonymous read-only counted table so the
        // code generator can loop over it.
        if let Value::Form(items) = &mut *value {
            let is_map = items
                .first()
                .and_then(Value::as_atom)
                .is_some_and(|h| self.map_heads.contains(&h));
            if is_map {
                if let Some(Value::List(elems) | Value::Vector(elems)) = items.get(3) {
                    if elems.len() > 8 {
                        let table = Table {
                            elem: ElemSize::Word,
                            pure: true,
                            length_prefix: true,
                            pattern: Vec::new(),
                            elements: elems.clone(),
                            loc: loc.clone(),
                        };
                        let id = self.set.tables.push(table);
                        items[3] = Value::Form(vec![
                            Value::Atom(self.set.marker),
                            Value::Int(id.as_u32() as i32),
                        ]);
                    }
                }
            }
        }

        let lowered = match &*value {
            Value::Form(items) => match items.first().and_then(Value::as_atom) {
                Some(head) => match self.table_heads.iter().position(|&h| h == head) {
                    Some(pos) => Some(self.lower(pos, &items[1..], loc)?),
                    None => None,
                },
                None => None,
            },
            _ => None,
        };
        if let Some(table) = lowered {
            let id = self.set.tables.push(table);
            *value = Value::Form(vec![
                Value::Atom(self.set.marker),
                Value::Int(id.as_u32() as i32),
            ]);
        }
        Ok(())
    }

    /// `pos` selects TABLE / ITABLE / LTABLE / PTABLE.
    fn lower(&mut self, pos: usize, args: &[Value], loc: &Location) -> CompileResult<Table> {
        let mut table = Table {
            elem: ElemSize::Word,
            pure: pos == 3,
            length_prefix: pos == 2,
            pattern: Vec::new(),
            elements: Vec::new(),
            loc: loc.clone(),
        };
        let mut rest = args;

        if pos == 1 {
            return self.lower_itable(table, rest, loc);
        }

        // Optional leading flag list.
        if let Some(Value::List(flags)) = rest.first() {
            self.apply_flags(&mut table, flags, loc)?;
            rest = &rest[1..];
        }
        table.elements = rest.to_vec();
        Ok(table)
    }

    /// `<ITABLE [NONE|BYTE|WORD|(flags…)] count [defaults…]>`: `count`
    /// repetitions of the default sequence (one zero if absent).
    fn lower_itable(
        &mut self,
        mut table: Table,
        mut rest: &[Value],
        loc: &Location,
    ) -> CompileResult<Table> {
        table.length_prefix = true;
        match rest.first() {
            Some(Value::Atom(a)) if *a == self.flag_atoms.none => {
                table.length_prefix = false;
                rest = &rest[1..];
            }
            Some(Value::Atom(a)) if *a == self.flag_atoms.byte => {
                table.elem = ElemSize::Byte;
                rest = &rest[1..];
            }
            Some(Value::Atom(a)) if *a == self.flag_atoms.word => {
                rest = &rest[1..];
            }
            Some(Value::List(flags)) => {
                let flags = flags.clone();
                self.apply_flags(&mut table, &flags, loc)?;
                rest = &rest[1..];
            }
            _ => {}
        }
        let Some(Value::Int(count)) = rest.first() else {
            return Err(CompileError::Semantic {
                loc: loc.clone(),
                message: "ITABLE length must be a literal number".into(),
            });
        };
        if *count < 0 {
            return Err(CompileError::Semantic {
                loc: loc.clone(),
                message: "ITABLE length must not be negative".into(),
            });
        }
        let defaults = &rest[1..];
        let unit: &[Value] = if defaults.is_empty() { &[Value::Int(0)] } else { defaults };
        table.elements = unit
            .iter()
            .cloned()
            .cycle()
            .take(unit.len() * *count as usize)
            .collect();
        Ok(table)
    }

    fn apply_flags(
        &mut self,
        table: &mut Table,
        flags: &[Value],
        loc: &Location,
    ) -> CompileResult<()> {
        let mut i = 0;
        while i < flags.len() {
            match &flags[i] {
                Value::Atom(a) if *a == self.flag_atoms.byte => table.elem = ElemSize::Byte,
                Value::Atom(a) if *a == self.flag_atoms.word => table.elem = ElemSize::Word,
                Value::Atom(a) if *a == self.flag_atoms.pure => table.pure = true,
                Value::Atom(a) if *a == self.flag_atoms.length => table.length_prefix = true,
                Value::Atom(a) if *a == self.flag_atoms.pattern => {
                    // (PATTERN (BYTE WORD …))
                    i += 1;
                    let Some(Value::List(sizes)) = flags.get(i) else {
                        return Err(CompileError::Semantic {
                            loc: loc.clone(),
                            message: "PATTERN needs a (BYTE/WORD …) list".into(),
                        });
                    };
                    for s in sizes {
                        match s.as_atom() {
                            Some(a) if a == self.flag_atoms.byte => {
                                table.pattern.push(ElemSize::Byte)
                            }
                            Some(a) if a == self.flag_atoms.word => {
                                table.pattern.push(ElemSize::Word)
                            }
                            // REST markers and star counts degrade to
                            // the repeat-last rule.
                            _ => {}
                        }
                    }
                }
                other => {
                    // Unknown flags (TEMP-TABLE, SORT …) are tolerated.
                    let _ = other;
                }
            }
            i += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zilc_frontend::decl::recognize;
    use zilc_frontend::expand::Expander;
    use zilc_frontend::parser::Parser;
    use zilc_frontend::preprocess::SourceMap;

    fn tables(src: &str) -> (Program, TableSet, Interner) {
        let map = SourceMap::single_file("t.zil", src);
        let mut interner = Interner::new();
        let tops = Parser::new(src, &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        let tops = Expander::new(&mut interner).expand_program(tops, &map).unwrap();
        let mut program = recognize(tops, &mut interner, &map).unwrap();
        let set = collect(&mut program, &mut interner).unwrap();
        (program, set, interner)
    }

    struct ConstOnly;
    impl ImmResolver for ConstOnly {
        fn resolve(&mut self, v: &Value, loc: &Location) -> CompileResult<Imm> {
            v.as_int().map(Imm::Const).ok_or_else(|| CompileError::Semantic {
                loc: loc.clone(),
                message: "non-constant".into(),
            })
        }
    }

    #[test]
    fn word_table_sizes_and_bytes() {
        let (p, set, _) = tables("<GLOBAL T <TABLE 1 2 300>>");
        let id = set.ref_of(&p.globals[0].value).unwrap();
        assert_eq!(set.size_of(id), 6);
        let mut fx = Vec::new();
        let bytes = set
            .emit(id, Region::DynTables, 0, &mut ConstOnly, &mut fx)
            .unwrap();
        assert_eq!(bytes, vec![0, 1, 0, 2, 1, 44]);
        assert!(fx.is_empty());
    }

    #[test]
    fn byte_and_length_flags() {
        let (p, set, _) = tables("<GLOBAL T <TABLE (BYTE LENGTH) 10 20>>");
        let id = set.ref_of(&p.globals[0].value).unwrap();
        assert_eq!(set.size_of(id), 3);
        let bytes = set
            .emit(id, Region::DynTables, 0, &mut ConstOnly, &mut Vec::new())
            .unwrap();
        assert_eq!(bytes, vec![2, 10, 20]);
    }

    #[test]
    fn ltable_prefixes_count() {
        let (p, set, _) = tables("<GLOBAL T <LTABLE 7 8>>");
        let id = set.ref_of(&p.globals[0].value).unwrap();
        let bytes = set
            .emit(id, Region::DynTables, 0, &mut ConstOnly, &mut Vec::new())
            .unwrap();
        assert_eq!(bytes, vec![0, 2, 0, 7, 0, 8]);
    }

    #[test]
    fn itable_repeats_defaults() {
        let (p, set, _) = tables("<GLOBAL T <ITABLE NONE 3 0>>");
        let id = set.ref_of(&p.globals[0].value).unwrap();
        assert_eq!(set.size_of(id), 6);
        let (p, set, _) = tables("<GLOBAL T <ITABLE BYTE 4>>");
        let id = set.ref_of(&p.globals[0].value).unwrap();
        // Byte length prefix + 4 byte elements.
        assert_eq!(set.size_of(id), 5);
        assert_eq!(
            set.emit(id, Region::DynTables, 0, &mut ConstOnly, &mut Vec::new()).unwrap(),
            vec![4, 0, 0, 0, 0]
        );
    }

    #[test]
    fn ptable_is_pure_and_nested_tables_collect_first() {
        let (p, set, _) = tables("<GLOBAL T <PTABLE 1 <TABLE 2>>>");
        assert_eq!(set.len(), 2);
        let outer = set.ref_of(&p.globals[0].value).unwrap();
        assert!(set.get(outer).pure);
        // The inner table collected first.
        let inner = set.ref_of(&set.get(outer).elements[1]).unwrap();
        assert!(!set.get(inner).pure);
        assert_eq!(inner.as_u32(), 0);
    }

    #[test]
    fn byte_markers_override_element_size() {
        let (p, set, _) = tables("<GLOBAL T <TABLE 1 #BYTE 2>>");
        let id = set.ref_of(&p.globals[0].value).unwrap();
        assert_eq!(set.size_of(id), 3);
    }
}
