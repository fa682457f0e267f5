//! Code generation and story-file assembly for the zilc compiler.
//!
//! [`compile`] drives the whole pipeline:
//!
//! 1. Front end (`zilc-frontend`): preprocess, lex, parse, expand
//!    macros, recognize declarations.
//! 2. Declaration pass: number objects, flags, properties and globals
//!    ([`symbols`]); collect user tables ([`tables`]); build the
//!    dictionary and parser tables.
//! 3. Phase-1 layout: fix every data-region base ([`layout::plan`]), so
//!    data addresses are plain constants during code generation.
//! 4. Code generation ([`gen`]): one bytecode blob per routine, with
//!    placeholder references to routines and strings.
//! 5. Phase-2 assembly ([`layout::assemble`]): concatenate regions,
//!    append routines and strings, run fixups, finish the header.
//!
//! The compiler is deterministic: identical inputs and options produce
//! byte-identical story files.

pub mod code;
pub mod dictionary;
pub mod fixup;
pub mod gen;
pub mod layout;
pub mod objects;
pub mod resolve;
pub mod result;
pub mod strings;
pub mod symbols;
pub mod syntax;
pub mod tables;

use cranelift_entity::EntityRef;
use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};

use zilc_frontend::decl::{recognize, Program};
use zilc_frontend::expand::Expander;
use zilc_frontend::intern::{Atom, Interner};
use zilc_frontend::parser::Parser;
use zilc_frontend::preprocess::{Preprocessor, SourceLoader};
use zilc_frontend::value::Value;
use zilc_zmachine::header::DEFAULT_SERIAL;
use zilc_zmachine::text::AbbrevTable;
use zilc_zmachine::version::MAX_ABBREVS;
use zilc_zmachine::ZVersion;

use crate::fixup::{Imm, RefKind};
use crate::resolve::Resolver;
use crate::result::{CompileError, CompileResult, Diagnostics, Warning};
use crate::strings::StringTable;
use crate::tables::TableId;

pub use crate::result::{CompileError as Error, Warning as CompileWarning};

/// Compiler options. Everything here comes from the command line; the
/// source can override the version with `<VERSION …>`.
#[derive(Clone, Debug)]
pub struct Options {
    pub version: Option<ZVersion>,
    pub release: u16,
    pub serial: Option<[u8; 6]>,
    pub warning_limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options { version: None, release: 1, serial: None, warning_limit: 100 }
    }
}

#[derive(Debug)]
pub struct CompileOutput {
    pub image: Vec<u8>,
    pub warnings: Vec<Warning>,
    pub version: ZVersion,
}

/// Compile one ZIL source to a story file image.
pub fn compile(
    file_name: &str,
    source: &str,
    loader: &mut dyn SourceLoader,
    options: &Options,
) -> CompileResult<CompileOutput> {
    let mut diag = Diagnostics::new(options.warning_limit);

    // Front end.
    let pre = Preprocessor::new(loader, options.version.map(ZVersion::number))
        .run(file_name, source)?;
    let mut interner = Interner::new();
    let tops = Parser::new(&pre.text, &pre.map, &mut interner)?.parse_program()?;
    let tops = Expander::new(&mut interner).expand_program(tops, &pre.map)?;
    let mut program = recognize(tops, &mut interner, &pre.map)?;

    let version = match program.version.or(pre.version) {
        Some(n) => ZVersion::from_number(n).expect("recognizer validated the number"),
        None => options.version.unwrap_or(ZVersion::V3),
    };
    info!("compiling {file_name} for {version}");

    if let Some((form, loc)) = program.unknown.first() {
        return Err(CompileError::Semantic {
            loc: loc.clone(),
            message: format!(
                "unrecognized top-level form {}",
                form.display(&interner)
            ),
        });
    }

    // Declaration passes.
    let user_tables = tables::collect(&mut program, &mut interner)?;
    let world = symbols::build(&program, version, &mut interner, &mut diag)?;
    let dict = dictionary::build(&program, &world, &mut interner, &mut diag)?;
    let parser_tables = syntax::build(&program, &world, &dict, &mut interner, &mut diag)?;
    let new_parser = pre.flags.get("NEW-PARSER?").copied().unwrap_or(false);

    let mut abbrevs = AbbrevTable::new();
    for text in &program.abbreviations {
        if abbrevs.push(text).is_none() {
            diag.warn(
                None,
                format!("more than {MAX_ABBREVS} abbreviations; the rest are ignored"),
            )?;
            break;
        }
    }

    // Encoding behavior driven by source flags: `PRESERVE-SPACES?`
    // keeps double spaces after periods, `CRLF-CHARACTER` replaces the
    // `|` newline code.
    let mut text_opts = zilc_zmachine::EncodeOpts {
        preserve_spaces: pre.flags.get("PRESERVE-SPACES?").copied().unwrap_or(false),
        ..Default::default()
    };
    let crlf = interner.intern("CRLF-CHARACTER");
    if let Some(def) = program.constants.iter().find(|c| c.name == crlf) {
        if let Some(code) = def.value.as_int() {
            text_opts.newline_zscii = code as u8;
        }
    }

    // Phase-1 layout: all data addresses become constants.
    let object_region = objects::plan(&world, &mut interner, &text_opts, &mut diag)?;
    let plan = layout::plan(version, &object_region, &user_tables, &dict, &parser_tables, &abbrevs)?;

    // The derived constants: dictionary words, property numbers, action
    // numbers, parser-table bases.
    let special = build_specials(
        &mut interner,
        &world,
        &dict,
        &parser_tables,
        &plan,
        new_parser,
    );
    let global_tables = collect_global_tables(&program, &user_tables);

    let mut string_table = StringTable::new();
    let const_values = resolve::resolve_constants(
        &world,
        &mut interner,
        &mut string_table,
        &user_tables,
        &plan.table_addrs,
        &special,
        &global_tables,
    )?;

    warn_unused(&program, &world, &interner, &mut diag)?;

    // Code generation. Definitions were cloned into the world in id
    // order.
    let defs: Vec<_> = world.routines.values().cloned().collect();
    let atom_t = interner.intern("T");
    let atom_gval = interner.intern("GVAL");
    let atom_lval = interner.intern("LVAL");
    let mut resolver = Resolver {
        world: &world,
        interner: &mut interner,
        strings: &mut string_table,
        tables: &user_tables,
        table_addrs: &plan.table_addrs,
        special: &special,
        const_values: &const_values,
        global_tables: &global_tables,
        atom_t,
        atom_gval,
        atom_lval,
    };
    let mut genned = Vec::with_capacity(defs.len());
    for (i, def) in defs.iter().enumerate() {
        let is_go = world.go.map(|id| id.index() == i).unwrap_or(false);
        genned.push(gen::gen_routine(def, is_go, &mut resolver, &mut diag)?);
    }
    debug!("generated {} routine(s)", genned.len());

    // Phase-2 assembly.
    let asm_opts = layout::AsmOptions {
        release: options.release,
        serial: options.serial.unwrap_or(DEFAULT_SERIAL),
        time_status: program.time_status,
        text_opts,
    };
    let image = layout::assemble(
        &plan,
        &asm_opts,
        &object_region,
        &user_tables,
        &dict,
        &parser_tables,
        &abbrevs,
        &genned,
        &mut resolver,
        &mut diag,
    )?;

    info!("{file_name}: {} bytes, {} warning(s)", image.len(), diag.len());
    Ok(CompileOutput { image, warnings: diag.into_warnings(), version })
}

/// `W?…`, `P?…`, `ACT?…`/`V?…` constants, and the parser-table bases.
fn build_specials(
    interner: &mut Interner,
    world: &symbols::World,
    dict: &dictionary::Dictionary,
    parser_tables: &syntax::ParserTables,
    plan: &layout::Phase1,
    new_parser: bool,
) -> FxHashMap<Atom, Imm> {
    let mut special = FxHashMap::default();

    for (atom, position) in dict.words() {
        let name = interner.name(atom).to_owned();
        let wref = interner.intern(&format!("W?{name}"));
        let imm = if new_parser {
            Imm::Ref(RefKind::Vocab, position as u32)
        } else {
            Imm::Const(i32::from(
                dict.address_of(atom, plan.dict_base).expect("word is in the dictionary"),
            ))
        };
        special.insert(wref, imm);
    }

    for &(name, id) in &world.properties {
        let pname = interner.name(name).to_owned();
        let pref = interner.intern(&format!("P?{pname}"));
        special.insert(pref, Imm::Const(i32::from(id)));
    }

    for &(atom, number) in &parser_tables.action_constants {
        special.insert(atom, Imm::Const(i32::from(number)));
    }

    // Table bases for library code that addresses them directly.
    let n_actions = parser_tables.action_count() as i32;
    let bases = [
        ("VOCAB", i32::from(plan.dict_base)),
        ("ACTIONS", i32::from(plan.parser_base)),
        ("PREACTIONS", i32::from(plan.parser_base) + 2 * n_actions),
        ("VERBS", i32::from(plan.parser_base) + 4 * n_actions),
    ];
    for (name, value) in bases {
        let atom = interner.intern(name);
        if world.lookup(atom).is_none() {
            special.insert(atom, Imm::Const(value));
        }
    }
    special
}

/// Globals whose initializer is a table reference.
fn collect_global_tables(
    program: &Program,
    user_tables: &tables::TableSet,
) -> FxHashMap<Atom, TableId> {
    let mut out = FxHashMap::default();
    for def in &program.globals {
        if let Some(id) = user_tables.ref_of(&def.value) {
            out.insert(def.name, id);
        }
    }
    out
}

/// Unused-definition warnings: globals, constants and routines that no
/// other declaration ever mentions.
fn warn_unused(
    program: &Program,
    world: &symbols::World,
    interner: &Interner,
    diag: &mut Diagnostics,
) -> CompileResult<()> {
    let mut used: FxHashSet<Atom> = FxHashSet::default();
    fn walk(v: &Value, used: &mut FxHashSet<Atom>) {
        match v {
            Value::Atom(a) => {
                used.insert(*a);
            }
            Value::Quote(inner) => walk(inner, used),
            Value::List(items) | Value::Vector(items) | Value::Form(items)
            | Value::Splice(items) => {
                for item in items {
                    walk(item, used);
                }
            }
            _ => {}
        }
    }
    for def in &program.routines {
        for v in &def.body {
            walk(v, &mut used);
        }
        for p in &def.params {
            if let Some(d) = &p.default {
                walk(d, &mut used);
            }
        }
    }
    for def in &program.globals {
        walk(&def.value, &mut used);
    }
    for def in &program.constants {
        walk(&def.value, &mut used);
    }
    for def in &program.objects {
        for (_, values) in &def.props {
            for v in values {
                walk(v, &mut used);
            }
        }
    }
    for s in &program.syntaxes {
        used.insert(s.action);
        if let Some(p) = s.preaction {
            used.insert(p);
        }
    }

    for def in &program.globals {
        if !used.contains(&def.name) {
            diag.warn(
                Some(def.loc.clone()),
                format!("global {} is never used", interner.name(def.name)),
            )?;
        }
    }
    for def in &program.constants {
        if !used.contains(&def.name) {
            diag.warn(
                Some(def.loc.clone()),
                format!("constant {} is never used", interner.name(def.name)),
            )?;
        }
    }
    for def in &program.routines {
        let is_go = world.go.is_some()
            && world.routines[world.go.unwrap()].name == def.name;
        if !is_go && !used.contains(&def.name) {
            diag.warn(
                Some(def.loc.clone()),
                format!("routine {} is never called", interner.name(def.name)),
            )?;
        }
    }
    Ok(())
}
