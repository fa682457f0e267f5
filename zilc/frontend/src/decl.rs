//! Recognition of expanded top-level forms into typed declarations.
//!
//! Runs after macro expansion, so everything that reaches it is either
//! one of the known declaration operators or a leftover the back end
//! will reject. Values inside declarations (initializers, routine
//! bodies, table contents) stay as [`Value`] trees; lowering them is
//! the code generator's business.

use log::debug;

use crate::error::{FrontendError, Location};
use crate::intern::{Atom, Interner};
use crate::parser::TopLevel;
use crate::preprocess::SourceMap;
use crate::value::Value;

#[derive(Clone, Debug)]
pub struct ConstantDef {
    pub name: Atom,
    pub value: Value,
    pub loc: Location,
}

#[derive(Clone, Debug)]
pub struct GlobalDef {
    pub name: Atom,
    pub value: Value,
    pub loc: Location,
}

/// An `OBJECT` or `ROOM`. Property lists are kept raw; the object model
/// sorts out flags, vocabulary senses, exits and numbered properties.
#[derive(Clone, Debug)]
pub struct ObjectDef {
    pub name: Atom,
    pub is_room: bool,
    /// `(head value…)` pairs in source order.
    pub props: Vec<(Atom, Vec<Value>)>,
    pub loc: Location,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Required,
    Optional,
    Aux,
}

#[derive(Clone, Debug)]
pub struct RoutineParam {
    pub name: Atom,
    pub kind: ParamKind,
    /// Default expression, stored unevaluated.
    pub default: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct RoutineDef {
    pub name: Atom,
    pub params: Vec<RoutineParam>,
    pub body: Vec<Value>,
    pub loc: Location,
}

impl RoutineDef {
    pub fn required_count(&self) -> usize {
        self.params.iter().filter(|p| p.kind == ParamKind::Required).count()
    }

    pub fn optional_count(&self) -> usize {
        self.params.iter().filter(|p| p.kind == ParamKind::Optional).count()
    }
}

/// One object slot in a syntax line.
#[derive(Clone, Debug, Default)]
pub struct SyntaxSlot {
    pub prep: Option<Atom>,
    pub find_flag: Option<Atom>,
    pub options: Vec<Atom>,
}

#[derive(Clone, Debug)]
pub struct SyntaxDef {
    pub verb: Atom,
    pub slots: Vec<SyntaxSlot>,
    pub action: Atom,
    pub preaction: Option<Atom>,
    pub loc: Location,
}

/// Top-level vocabulary declarations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VocabKind {
    Synonym,
    Adjective,
    Preposition,
    Buzz,
}

#[derive(Clone, Debug)]
pub struct VocabDef {
    pub kind: VocabKind,
    pub words: Vec<Atom>,
    pub loc: Location,
}

#[derive(Clone, Debug)]
pub struct PropdefDef {
    pub name: Atom,
    pub default: Option<Value>,
    /// Pattern clauses, kept raw for the object model.
    pub patterns: Vec<Value>,
    pub loc: Location,
}

/// Everything the back end needs, in declaration order.
#[derive(Default)]
pub struct Program {
    pub version: Option<u8>,
    /// `<VERSION … TIME>`: show hours/minutes on the V3 status line.
    pub time_status: bool,
    pub constants: Vec<ConstantDef>,
    pub globals: Vec<GlobalDef>,
    pub objects: Vec<ObjectDef>,
    pub routines: Vec<RoutineDef>,
    pub syntaxes: Vec<SyntaxDef>,
    pub vocab: Vec<VocabDef>,
    pub directions: Vec<Atom>,
    pub propdefs: Vec<PropdefDef>,
    /// `(existing, alias)` pairs from `BIT-SYNONYM`.
    pub bit_synonyms: Vec<(Atom, Atom, Location)>,
    pub abbreviations: Vec<String>,
    /// Forms nobody recognized; the back end reports them.
    pub unknown: Vec<(Value, Location)>,
}

struct Recognizer<'a> {
    interner: &'a mut Interner,
    map: &'a SourceMap,
    program: Program,
    loc: Location,
    separator: Atom,
}

/// Drop `;` separator markers everywhere they are mere punctuation.
/// Vocabulary lists are handled before this runs; anywhere else the
/// token separates nothing and is skipped.
fn strip_separators(value: &mut Value, separator: Atom) {
    match value {
        Value::List(items) | Value::Vector(items) | Value::Form(items) | Value::Splice(items) => {
            items.retain(|v| v.as_atom() != Some(separator));
            for item in items {
                strip_separators(item, separator);
            }
        }
        Value::Quote(inner) => strip_separators(inner, separator),
        _ => {}
    }
}

/// Recognize every top-level form of an expanded program.
pub fn recognize(
    tops: Vec<TopLevel>,
    interner: &mut Interner,
    map: &SourceMap,
) -> Result<Program, FrontendError> {
    let separator = interner.intern(crate::parser::SEPARATOR_NAME);
    let mut r = Recognizer {
        interner,
        map,
        program: Program::default(),
        loc: Location::default(),
        separator,
    };
    for top in tops {
        r.loc = r.map.location(top.offset);
        r.top_form(top.value)?;
    }
    debug!(
        "recognized {} routine(s), {} object(s), {} global(s), {} syntax line(s)",
        r.program.routines.len(),
        r.program.objects.len(),
        r.program.globals.len(),
        r.program.syntaxes.len()
    );
    Ok(r.program)
}

impl<'a> Recognizer<'a> {
    fn err(&self, message: impl Into<String>) -> FrontendError {
        FrontendError::Other { loc: self.loc.clone(), message: message.into() }
    }

    fn name(&self, a: Atom) -> &str {
        self.interner.name(a)
    }

    fn top_form(&mut self, value: Value) -> Result<(), FrontendError> {
        let Value::Form(items) = &value else {
            // Stray strings or atoms at top level are comments in
            // practice; drop them.
            return Ok(());
        };
        let Some(head) = items.first().and_then(Value::as_atom) else {
            self.program.unknown.push((value.clone(), self.loc.clone()));
            return Ok(());
        };
        let mut args = items[1..].to_vec();
        let keeps_separators = matches!(
            self.name(head),
            "SYNONYM" | "VERB-SYNONYM" | "PREP-SYNONYM" | "ADJ-SYNONYMS" | "ADJ-SYNONYM"
                | "DIR-SYNONYMS" | "ADJECTIVE" | "PREPOSITION" | "BUZZ"
        );
        if !keeps_separators {
            for a in &mut args {
                strip_separators(a, self.separator);
            }
        }
        match self.name(head) {
            "VERSION" => self.version(&args),
            "CONSTANT" => self.constant(&args),
            "GLOBAL" | "GLOBAL-DEF" => self.global(&args),
            "OBJECT" => self.object(&args, false),
            "ROOM" => self.object(&args, true),
            "ROUTINE" => self.routine(&args),
            "SYNTAX" => self.syntax(&args),
            "SYNONYM" | "VERB-SYNONYM" | "PREP-SYNONYM" | "ADJ-SYNONYM" | "DIR-SYNONYMS" => {
                self.vocab(VocabKind::Synonym, &args)
            }
            "ADJECTIVE" => self.vocab(VocabKind::Adjective, &args),
            "PREPOSITION" => self.vocab(VocabKind::Preposition, &args),
            "BUZZ" => self.vocab(VocabKind::Buzz, &args),
            "DIRECTIONS" => self.directions(&args),
            "PROPDEF" | "PROPSPEC" => self.propdef(&args),
            "BIT-SYNONYM" => self.bit_synonym(&args),
            "ABBREVIATE" => self.abbreviate(&args),
            // Accepted and ignored: an abbreviation source we do not
            // generate from, and pure-MDL bookkeeping.
            "FREQUENT-WORDS?" | "SNAME" | "PRINC" | "ID" => Ok(()),
            _ => {
                self.program.unknown.push((value.clone(), self.loc.clone()));
                Ok(())
            }
        }
    }

    fn version(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        let first = args.first().ok_or_else(|| self.err("VERSION needs an argument"))?;
        let v = match first {
            Value::Int(n) if (3..=8).contains(n) => *n as u8,
            Value::Atom(a) => match self.name(*a) {
                "ZIP" => 3,
                "EZIP" => 4,
                "XZIP" => 5,
                "YZIP" => 6,
                other => return Err(self.err(format!("unknown version name {other}"))),
            },
            _ => return Err(self.err("VERSION needs a number 3-8 or a ZIP-family name")),
        };
        self.program.version = Some(v);
        for extra in &args[1..] {
            match extra.as_atom().map(|a| self.name(a)) {
                Some("TIME") => self.program.time_status = true,
                _ => return Err(self.err("unknown VERSION option")),
            }
        }
        Ok(())
    }

    fn constant(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        let [Value::Atom(name), value] = args else {
            return Err(self.err("CONSTANT needs a name and a value"));
        };
        self.program.constants.push(ConstantDef {
            name: *name,
            value: value.clone(),
            loc: self.loc.clone(),
        });
        Ok(())
    }

    fn global(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        let (name, value) = match args {
            [Value::Atom(name), value] => (*name, value.clone()),
            [Value::Atom(name)] => (*name, Value::Int(0)),
            _ => return Err(self.err("GLOBAL needs a name and a value")),
        };
        self.program.globals.push(GlobalDef { name, value, loc: self.loc.clone() });
        Ok(())
    }

    fn object(&mut self, args: &[Value], is_room: bool) -> Result<(), FrontendError> {
        let Some(Value::Atom(name)) = args.first() else {
            return Err(self.err("OBJECT needs a name"));
        };
        let mut props = Vec::new();
        for prop in &args[1..] {
            let Value::List(pair) = prop else {
                return Err(self.err("object properties must be (name value…) lists"));
            };
            let Some(Value::Atom(head)) = pair.first() else {
                return Err(self.err("object property must start with an atom"));
            };
            props.push((*head, pair[1..].to_vec()));
        }
        self.program.objects.push(ObjectDef {
            name: *name,
            is_room,
            props,
            loc: self.loc.clone(),
        });
        Ok(())
    }

    fn routine(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        let Some(Value::Atom(name)) = args.first() else {
            return Err(self.err("ROUTINE needs a name"));
        };
        // An optional activation atom may sit between name and params;
        // the Z-machine has no use for it, so it is skipped.
        let mut rest = &args[1..];
        if matches!(rest.first(), Some(Value::Atom(_))) {
            rest = &rest[1..];
        }
        let Some(Value::List(params)) = rest.first() else {
            return Err(self.err("ROUTINE needs a parameter list"));
        };
        let params = self.routine_params(params)?;
        let body = rest[1..].to_vec();
        if body.is_empty() {
            return Err(self.err("ROUTINE needs a body"));
        }
        self.program.routines.push(RoutineDef {
            name: *name,
            params,
            body,
            loc: self.loc.clone(),
        });
        Ok(())
    }

    fn routine_params(&mut self, list: &[Value]) -> Result<Vec<RoutineParam>, FrontendError> {
        let mut kind = ParamKind::Required;
        let mut out = Vec::new();
        for item in list {
            match item {
                Value::String(s) => {
                    kind = match s.to_ascii_uppercase().as_str() {
                        "OPT" | "OPTIONAL" => ParamKind::Optional,
                        "AUX" | "EXTRA" => ParamKind::Aux,
                        other => {
                            return Err(self.err(format!("unknown parameter marker {other:?}")))
                        }
                    };
                }
                Value::Atom(a) => {
                    // `AUX` and `OPT` are accepted as bare atoms too;
                    // MDL sources spell them both ways.
                    match self.name(*a) {
                        "AUX" | "EXTRA" => kind = ParamKind::Aux,
                        "OPT" | "OPTIONAL" => kind = ParamKind::Optional,
                        _ => out.push(RoutineParam {
                            name: *a,
                            kind: kind.clone(),
                            default: None,
                        }),
                    }
                }
                Value::Quote(inner) => {
                    let Some(a) = inner.as_atom() else {
                        return Err(self.err("quoted parameter must be an atom"));
                    };
                    out.push(RoutineParam { name: a, kind: kind.clone(), default: None });
                }
                Value::List(pair) => {
                    let [Value::Atom(a), default] = pair.as_slice() else {
                        return Err(self.err("defaulted parameter must be (name default)"));
                    };
                    if kind == ParamKind::Required {
                        return Err(self.err("required parameters cannot take defaults"));
                    }
                    out.push(RoutineParam {
                        name: *a,
                        kind: kind.clone(),
                        default: Some(default.clone()),
                    });
                }
                other => {
                    let shown = other.display(self.interner);
                    return Err(self.err(format!("unexpected parameter {shown}")));
                }
            }
        }
        Ok(out)
    }

    /// `<SYNTAX verb [prep] OBJECT [(FIND flag)] [(options…)] … = action [preaction]>`
    fn syntax(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        let eq = self.interner.intern("=");
        let object_kw = self.interner.intern("OBJECT");
        let find_kw = self.interner.intern("FIND");

        let Some(Value::Atom(verb)) = args.first() else {
            return Err(self.err("SYNTAX needs a verb word"));
        };
        let split = args
            .iter()
            .position(|v| v.as_atom() == Some(eq))
            .ok_or_else(|| self.err("SYNTAX needs `= action`"))?;
        let (pattern, actions) = (&args[1..split], &args[split + 1..]);

        let mut slots: Vec<SyntaxSlot> = Vec::new();
        let mut pending_prep: Option<Atom> = None;
        for item in pattern {
            match item {
                Value::Atom(a) if *a == object_kw => {
                    if slots.len() == 2 {
                        return Err(self.err("SYNTAX supports at most two objects"));
                    }
                    slots.push(SyntaxSlot { prep: pending_prep.take(), ..Default::default() });
                }
                Value::Atom(a) => {
                    if pending_prep.replace(*a).is_some() {
                        return Err(self.err("two prepositions in a row in SYNTAX"));
                    }
                }
                Value::List(opts) => {
                    let slot = slots
                        .last_mut()
                        .ok_or_else(|| self.err("SYNTAX options before any OBJECT"))?;
                    match opts.split_first() {
                        Some((Value::Atom(h), rest)) if *h == find_kw => {
                            slot.find_flag = rest.first().and_then(Value::as_atom);
                        }
                        _ => {
                            for o in opts {
                                if let Some(a) = o.as_atom() {
                                    slot.options.push(a);
                                }
                            }
                        }
                    }
                }
                other => {
                    let shown = other.display(self.interner);
                    return Err(self.err(format!("unexpected {shown} in SYNTAX pattern")));
                }
            }
        }
        if pending_prep.is_some() && slots.is_empty() {
            // `<SYNTAX LOOK UP = …>`: a bare preposition with no object
            // still contributes the preposition word.
            slots.push(SyntaxSlot { prep: pending_prep.take(), ..Default::default() });
        }

        let action = match actions.first() {
            Some(Value::Atom(a)) => *a,
            _ => return Err(self.err("SYNTAX needs an action routine after `=`")),
        };
        let preaction = match actions.get(1) {
            Some(Value::Atom(a)) => Some(*a),
            None => None,
            Some(_) => return Err(self.err("SYNTAX preaction must be an atom")),
        };
        self.program.syntaxes.push(SyntaxDef {
            verb: *verb,
            slots,
            action,
            preaction,
            loc: self.loc.clone(),
        });
        Ok(())
    }

    fn vocab(&mut self, kind: VocabKind, args: &[Value]) -> Result<(), FrontendError> {
        let sep = self.interner.intern(crate::parser::SEPARATOR_NAME);
        let mut words = Vec::new();
        for a in args {
            match a {
                Value::Atom(w) if *w != sep => words.push(*w),
                Value::Atom(_) => {}
                _ => return Err(self.err("vocabulary words must be atoms")),
            }
        }
        if words.is_empty() {
            return Err(self.err("empty vocabulary declaration"));
        }
        self.program.vocab.push(VocabDef { kind, words, loc: self.loc.clone() });
        Ok(())
    }

    fn directions(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        if !self.program.directions.is_empty() {
            return Err(self.err("DIRECTIONS declared twice"));
        }
        for a in args {
            match a.as_atom() {
                Some(d) => self.program.directions.push(d),
                None => return Err(self.err("directions must be atoms")),
            }
        }
        if self.program.directions.is_empty() {
            return Err(self.err("DIRECTIONS needs at least one direction"));
        }
        Ok(())
    }

    fn propdef(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        let Some(Value::Atom(name)) = args.first() else {
            return Err(self.err("PROPDEF needs a property name"));
        };
        let default = match args.get(1) {
            Some(v) if !v.is_false() => Some(v.clone()),
            _ => None,
        };
        self.program.propdefs.push(PropdefDef {
            name: *name,
            default,
            patterns: args.get(2..).unwrap_or(&[]).to_vec(),
            loc: self.loc.clone(),
        });
        Ok(())
    }

    fn bit_synonym(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        let Some(Value::Atom(existing)) = args.first() else {
            return Err(self.err("BIT-SYNONYM needs an existing flag"));
        };
        for alias in &args[1..] {
            let Some(a) = alias.as_atom() else {
                return Err(self.err("BIT-SYNONYM aliases must be atoms"));
            };
            self.program.bit_synonyms.push((*existing, a, self.loc.clone()));
        }
        Ok(())
    }

    fn abbreviate(&mut self, args: &[Value]) -> Result<(), FrontendError> {
        for a in args {
            match a {
                Value::String(s) => self.program.abbreviations.push(s.clone()),
                _ => return Err(self.err("ABBREVIATE takes strings")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::Expander;
    use crate::parser::Parser;

    fn program(src: &str) -> (Program, Interner) {
        let map = SourceMap::single_file("t.zil", src);
        let mut interner = Interner::new();
        let tops = Parser::new(src, &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        let tops = Expander::new(&mut interner).expand_program(tops, &map).unwrap();
        let p = recognize(tops, &mut interner, &map).unwrap();
        (p, interner)
    }

    #[test]
    fn routine_with_parameters() {
        let (p, mut i) = program(
            "<ROUTINE FOO (A B \"OPT\" (C 5) \"AUX\" D) <RTRUE>>",
        );
        let r = &p.routines[0];
        assert_eq!(r.name, i.intern("FOO"));
        assert_eq!(r.required_count(), 2);
        assert_eq!(r.optional_count(), 1);
        assert_eq!(r.params[2].default, Some(Value::Int(5)));
        assert_eq!(r.params[3].kind, ParamKind::Aux);
    }

    #[test]
    fn object_properties_kept_raw() {
        let (p, mut i) = program(
            "<OBJECT LAMP (DESC \"brass lantern\") (FLAGS TAKEBIT LIGHTBIT) (SIZE 15)>",
        );
        let o = &p.objects[0];
        assert!(!o.is_room);
        assert_eq!(o.props.len(), 3);
        assert_eq!(o.props[1].0, i.intern("FLAGS"));
    }

    #[test]
    fn syntax_with_two_objects() {
        let (p, mut i) = program(
            "<SYNTAX PUT OBJECT (FIND TAKEBIT) IN OBJECT = V-PUT-IN PRE-PUT>",
        );
        let s = &p.syntaxes[0];
        assert_eq!(s.verb, i.intern("PUT"));
        assert_eq!(s.slots.len(), 2);
        assert_eq!(s.slots[0].find_flag, Some(i.intern("TAKEBIT")));
        assert_eq!(s.slots[1].prep, Some(i.intern("IN")));
        assert_eq!(s.action, i.intern("V-PUT-IN"));
        assert_eq!(s.preaction, Some(i.intern("PRE-PUT")));
    }

    #[test]
    fn version_with_time() {
        let (p, _) = program("<VERSION ZIP TIME>");
        assert_eq!(p.version, Some(3));
        assert!(p.time_status);
    }

    #[test]
    fn directions_and_vocab() {
        let (p, mut i) = program(
            "<DIRECTIONS NORTH SOUTH EAST WEST> <BUZZ A AN THE> <SYNONYM NORTH N>",
        );
        assert_eq!(p.directions.len(), 4);
        assert_eq!(p.vocab.len(), 2);
        assert_eq!(p.vocab[0].kind, VocabKind::Buzz);
        assert_eq!(p.vocab[1].words, vec![i.intern("NORTH"), i.intern("N")]);
    }

    #[test]
    fn unknown_forms_are_reported_not_fatal() {
        let (p, _) = program("<MYSTERY-OP 1 2>");
        assert_eq!(p.unknown.len(), 1);
    }
}
