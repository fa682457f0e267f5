//! The symbol and object model.
//!
//! The declaration pass walks every top-level definition and assigns
//! the numbers the Z-machine cares about: object numbers (reverse
//! definition order, per ZILF convention), flag bits, property numbers
//! (directions highest, then descending on first use), global slots.
//! Code generation later resolves names against the [`World`] built
//! here; the assembler writes final addresses in its own pass.

use cranelift_entity::PrimaryMap;
use log::debug;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use zilc_frontend::decl::{ConstantDef, GlobalDef, ObjectDef, Program, PropdefDef, RoutineDef};
use zilc_frontend::error::Location;
use zilc_frontend::intern::{Atom, Interner};
use zilc_frontend::value::Value;
use zilc_zmachine::version::{ZVersion, FIRST_GLOBAL_VAR, GLOBAL_SLOTS};

use crate::fixup::RoutineId;
use crate::result::{CompileError, CompileResult, Diagnostics};

/// What a name means.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sym {
    Object(u16),
    Routine(RoutineId),
    /// Variable number 16..=255.
    Global(u8),
    /// Index into `World::constants`.
    Constant(u32),
    Flag(u8),
    Property(u8),
}

pub struct World {
    pub version: ZVersion,
    pub symbols: FxHashMap<Atom, Sym>,
    /// Objects indexed by `number - 1`.
    pub objects: Vec<ObjectDef>,
    pub routines: PrimaryMap<RoutineId, RoutineDef>,
    pub globals: Vec<GlobalDef>,
    pub constants: Vec<ConstantDef>,
    /// Canonical flag names; the id is the index.
    pub flags: Vec<Atom>,
    /// `(name, property number)` in assignment order.
    pub properties: Vec<(Atom, u8)>,
    /// Properties live in their own namespace: `WINDOW` may name both
    /// an object and a property, as in the original games.
    prop_ids: FxHashMap<Atom, u8>,
    /// `(name, property number)` in declaration order; ids descend.
    pub directions: Vec<(Atom, u8)>,
    pub propdefs: FxHashMap<Atom, PropdefDef>,
    pub go: Option<RoutineId>,
}

impl World {
    pub fn lookup(&self, atom: Atom) -> Option<Sym> {
        self.symbols.get(&atom).copied()
    }

    pub fn object_number(&self, atom: Atom) -> Option<u16> {
        match self.lookup(atom)? {
            Sym::Object(n) => Some(n),
            _ => None,
        }
    }

    pub fn property_id(&self, atom: Atom) -> Option<u8> {
        self.prop_ids.get(&atom).copied()
    }

    pub fn flag_id(&self, atom: Atom) -> Option<u8> {
        match self.lookup(atom)? {
            Sym::Flag(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_direction(&self, atom: Atom) -> bool {
        self.directions.iter().any(|&(d, _)| d == atom)
    }
}

fn semantic(loc: &Location, message: impl Into<String>) -> CompileError {
    CompileError::Semantic { loc: loc.clone(), message: message.into() }
}

struct Builder<'a> {
    interner: &'a mut Interner,
    diag: &'a mut Diagnostics,
    world: World,
    next_prop: u8,
}

/// Build the world from a recognized program.
pub fn build(
    program: &Program,
    version: ZVersion,
    interner: &mut Interner,
    diag: &mut Diagnostics,
) -> CompileResult<World> {
    let world = World {
        version,
        symbols: FxHashMap::default(),
        objects: Vec::new(),
        routines: PrimaryMap::new(),
        globals: Vec::new(),
        constants: Vec::new(),
        flags: Vec::new(),
        properties: Vec::new(),
        prop_ids: FxHashMap::default(),
        directions: Vec::new(),
        propdefs: FxHashMap::default(),
        go: None,
    };
    let mut b = Builder { interner, diag, world, next_prop: version.max_property() };

    b.declare_routines(program)?;
    b.declare_objects(program)?;
    b.declare_globals(program)?;
    b.declare_constants(program)?;
    b.declare_directions(program)?;
    b.declare_propdefs(program)?;
    b.assign_flags(program)?;
    b.assign_properties(program)?;

    debug!(
        "world: {} objects, {} routines, {} globals, {} flags, {} properties",
        b.world.objects.len(),
        b.world.routines.len(),
        b.world.globals.len(),
        b.world.flags.len(),
        b.world.properties.len(),
    );
    Ok(b.world)
}

impl<'a> Builder<'a> {
    fn name(&self, a: Atom) -> &str {
        self.interner.name(a)
    }

    fn define(&mut self, name: Atom, sym: Sym, loc: &Location) -> CompileResult<()> {
        if self.world.symbols.insert(name, sym).is_some() {
            return Err(semantic(loc, format!("duplicate definition of {}", self.name(name))));
        }
        Ok(())
    }

    fn declare_routines(&mut self, program: &Program) -> CompileResult<()> {
        let go = self.interner.intern("GO");
        for def in &program.routines {
            let id = self.world.routines.push(def.clone());
            self.define(def.name, Sym::Routine(id), &def.loc)?;
            if def.name == go {
                if def.required_count() != 0 {
                    return Err(semantic(&def.loc, "GO must take no required parameters"));
                }
                self.world.go = Some(id);
            }
        }
        Ok(())
    }

    fn declare_objects(&mut self, program: &Program) -> CompileResult<()> {
        let count = program.objects.len();
        if count as u32 > self.world.version.max_objects() {
            let loc = &program.objects[count - 1].loc;
            return Err(semantic(
                loc,
                format!(
                    "{count} objects exceed the {} limit of {}",
                    self.world.version,
                    self.world.version.max_objects()
                ),
            ));
        }
        // Reverse definition order: the last-defined object is 1.
        self.world.objects = program.objects.iter().rev().cloned().collect();
        for (i, def) in self.world.objects.iter().enumerate() {
            let number = (i + 1) as u16;
            let loc = def.loc.clone();
            let name = def.name;
            if self.world.symbols.insert(name, Sym::Object(number)).is_some() {
                return Err(semantic(&loc, format!("duplicate definition of {}", self.name(name))));
            }
        }
        Ok(())
    }

    fn declare_globals(&mut self, program: &Program) -> CompileResult<()> {
        for def in &program.globals {
            let slot = self.world.globals.len();
            if slot >= GLOBAL_SLOTS {
                return Err(semantic(
                    &def.loc,
                    format!("more than {GLOBAL_SLOTS} global variables"),
                ));
            }
            self.define(def.name, Sym::Global(FIRST_GLOBAL_VAR + slot as u8), &def.loc)?;
            self.world.globals.push(def.clone());
        }
        Ok(())
    }

    fn declare_constants(&mut self, program: &Program) -> CompileResult<()> {
        for def in &program.constants {
            let index = self.world.constants.len() as u32;
            self.define(def.name, Sym::Constant(index), &def.loc)?;
            self.world.constants.push(def.clone());
        }
        Ok(())
    }

    fn declare_directions(&mut self, program: &Program) -> CompileResult<()> {
        let max = self.world.version.max_property();
        for (i, &dir) in program.directions.iter().enumerate() {
            let id = max - i as u8;
            if id == 0 {
                let loc = Location::default();
                return Err(semantic(&loc, "too many directions for this version"));
            }
            self.world.directions.push((dir, id));
            // A direction is also an ordinary property.
            self.world.prop_ids.insert(dir, id);
            self.world.symbols.entry(dir).or_insert(Sym::Property(id));
            self.world.properties.push((dir, id));
        }
        if let Some(&(_, lowest)) = self.world.directions.last() {
            self.next_prop = lowest - 1;
        }
        Ok(())
    }

    fn declare_propdefs(&mut self, program: &Program) -> CompileResult<()> {
        for def in &program.propdefs {
            self.world.propdefs.insert(def.name, def.clone());
            if self.world.property_id(def.name).is_none() {
                self.alloc_property(def.name, &def.loc)?;
            }
        }
        Ok(())
    }

    fn alloc_property(&mut self, name: Atom, loc: &Location) -> CompileResult<u8> {
        if self.next_prop == 0 {
            return Err(semantic(
                loc,
                format!(
                    "out of property numbers (limit {} on {})",
                    self.world.version.max_property(),
                    self.world.version
                ),
            ));
        }
        let id = self.next_prop;
        self.next_prop -= 1;
        self.world.properties.push((name, id));
        self.world.prop_ids.insert(name, id);
        // The property namespace is separate; a bare-atom reference
        // only sees the property when nothing else claims the name
        // (`P?NAME` always works).
        if self.world.symbols.get(&name).is_some() {
            let n = self.name(name).to_owned();
            self.diag.warn(
                Some(loc.clone()),
                format!("property {n} shares its name with another definition; use P?{n} for the number"),
            )?;
        } else {
            self.world.symbols.insert(name, Sym::Property(id));
        }
        Ok(id)
    }

    fn alloc_flag(&mut self, name: Atom, loc: &Location) -> CompileResult<u8> {
        if let Some(Sym::Flag(id)) = self.world.lookup(name) {
            return Ok(id);
        }
        let id = self.world.flags.len() as u16;
        if id >= self.world.version.attr_count() {
            return Err(semantic(
                loc,
                format!(
                    "out of attribute bits (limit {} on {})",
                    self.world.version.attr_count(),
                    self.world.version
                ),
            ));
        }
        self.world.flags.push(name);
        self.define(name, Sym::Flag(id as u8), loc)?;
        Ok(id as u8)
    }

    /// Flags come from object FLAGS lists, syntax FIND clauses, and
    /// BIT-SYNONYM aliases, in source order.
    fn assign_flags(&mut self, program: &Program) -> CompileResult<()> {
        let flags_head = self.interner.intern("FLAGS");
        for def in &program.objects {
            for (head, values) in &def.props {
                if *head != flags_head {
                    continue;
                }
                for v in values {
                    let Some(flag) = v.as_atom() else {
                        return Err(semantic(&def.loc, "FLAGS entries must be atoms"));
                    };
                    self.alloc_flag(flag, &def.loc)?;
                }
            }
        }
        for syntax in &program.syntaxes {
            for slot in &syntax.slots {
                if let Some(flag) = slot.find_flag {
                    self.alloc_flag(flag, &syntax.loc)?;
                }
            }
        }
        for &(existing, alias, ref loc) in &program.bit_synonyms {
            let Some(Sym::Flag(id)) = self.world.lookup(existing) else {
                return Err(semantic(
                    loc,
                    format!("BIT-SYNONYM of undefined flag {}", self.name(existing)),
                ));
            };
            self.define(alias, Sym::Flag(id), loc)?;
        }
        Ok(())
    }

    /// Everything in an object's property list that is not special
    /// syntax becomes a numbered property on first use.
    fn assign_properties(&mut self, program: &Program) -> CompileResult<()> {
        let specials: SmallVec<[Atom; 4]> = ["FLAGS", "DESC", "IN", "LOC"]
            .iter()
            .map(|n| self.interner.intern(n))
            .collect();
        for def in &program.objects {
            for (head, values) in &def.props {
                if specials.contains(head) && !self.is_exit_list(*head, values) {
                    continue;
                }
                if self.world.property_id(*head).is_none() {
                    self.alloc_property(*head, &def.loc)?;
                }
            }
        }
        Ok(())
    }

    /// `(IN TO room)` is a direction exit even though IN is special.
    fn is_exit_list(&mut self, head: Atom, values: &[Value]) -> bool {
        if !self.world.is_direction(head) {
            return false;
        }
        let second = values.first().and_then(Value::as_atom);
        let Some(second) = second else { return false };
        matches!(self.name(second), "TO" | "PER" | "SORRY" | "UEXIT")
            || self.world.object_number(second).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zilc_frontend::decl::recognize;
    use zilc_frontend::expand::Expander;
    use zilc_frontend::parser::Parser;
    use zilc_frontend::preprocess::SourceMap;

    fn world(src: &str) -> (World, Interner) {
        let map = SourceMap::single_file("t.zil", src);
        let mut interner = Interner::new();
        let tops = Parser::new(src, &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        let tops = Expander::new(&mut interner).expand_program(tops, &map).unwrap();
        let program = recognize(tops, &mut interner, &map).unwrap();
        let mut diag = Diagnostics::new(100);
        let w = build(&program, ZVersion::V3, &mut interner, &mut diag).unwrap();
        (w, interner)
    }

    #[test]
    fn objects_number_in_reverse() {
        let (w, mut i) = world("<OBJECT FIRST (DESC \"a\")> <OBJECT SECOND (DESC \"b\")>");
        assert_eq!(w.object_number(i.intern("SECOND")), Some(1));
        assert_eq!(w.object_number(i.intern("FIRST")), Some(2));
    }

    #[test]
    fn flags_assigned_in_source_order() {
        let (w, mut i) = world(
            "<OBJECT A (FLAGS TAKEBIT LIGHTBIT)> <OBJECT B (FLAGS LIGHTBIT ONBIT)>",
        );
        assert_eq!(w.flag_id(i.intern("TAKEBIT")), Some(0));
        assert_eq!(w.flag_id(i.intern("LIGHTBIT")), Some(1));
        assert_eq!(w.flag_id(i.intern("ONBIT")), Some(2));
    }

    #[test]
    fn bit_synonym_aliases() {
        let (w, mut i) = world(
            "<OBJECT A (FLAGS TOUCHBIT)> <BIT-SYNONYM TOUCHBIT TOUCHEDBIT>",
        );
        assert_eq!(w.flag_id(i.intern("TOUCHBIT")), w.flag_id(i.intern("TOUCHEDBIT")));
    }

    #[test]
    fn directions_take_highest_properties() {
        let (w, mut i) = world(
            "<DIRECTIONS NORTH SOUTH> <OBJECT A (SIZE 5)>",
        );
        assert_eq!(w.property_id(i.intern("NORTH")), Some(31));
        assert_eq!(w.property_id(i.intern("SOUTH")), Some(30));
        assert_eq!(w.property_id(i.intern("SIZE")), Some(29));
    }

    #[test]
    fn globals_get_slots_from_16() {
        let (w, mut i) = world("<GLOBAL SCORE 0> <GLOBAL MOVES 0>");
        assert_eq!(w.lookup(i.intern("SCORE")), Some(Sym::Global(16)));
        assert_eq!(w.lookup(i.intern("MOVES")), Some(Sym::Global(17)));
    }

    #[test]
    fn go_must_have_no_required_params() {
        let map = SourceMap::single_file("t.zil", "<ROUTINE GO (X) <RTRUE>>");
        let mut interner = Interner::new();
        let tops = Parser::new("<ROUTINE GO (X) <RTRUE>>", &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        let tops = Expander::new(&mut interner).expand_program(tops, &map).unwrap();
        let program = recognize(tops, &mut interner, &map).unwrap();
        let mut diag = Diagnostics::new(100);
        assert!(build(&program, ZVersion::V3, &mut interner, &mut diag).is_err());
    }
}
