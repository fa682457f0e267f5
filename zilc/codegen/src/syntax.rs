//! Parser tables: ACTIONS, PREACTIONS, VERBS and per-verb syntax lines.
//!
//! Classic (pre-NEW-PARSER?) layout. The VERBS table holds one word per
//! verb, indexed by `255 − verb number`, pointing at that verb's block
//! of syntax lines. Each line is 8 bytes:
//!
//! ```text
//! [object count] [prep1] [find1] [opts1] [prep2] [find2] [opts2] [action]
//! ```
//!
//! `find` bytes are flag number + 1 (0 = no FIND clause). ACTIONS and
//! PREACTIONS are word tables indexed by action number; entries are
//! routine references fixed up after layout, or 0 with a warning when
//! the routine was never defined, so that incomplete games still link.

use log::debug;
use rustc_hash::FxHashMap;

use zilc_frontend::decl::Program;
use zilc_frontend::intern::{Atom, Interner};

use crate::dictionary::Dictionary;
use crate::fixup::{Fixup, RefKind, Region};
use crate::result::{CompileError, CompileResult, Diagnostics};
use crate::symbols::{Sym, World};

/// Search-scope option bits in a syntax line.
pub mod opts {
    pub const HELD: u8 = 0x01;
    pub const CARRIED: u8 = 0x02;
    pub const ON_GROUND: u8 = 0x04;
    pub const IN_ROOM: u8 = 0x08;
    pub const MANY: u8 = 0x10;
    pub const HAVE: u8 = 0x20;
    pub const TAKE: u8 = 0x40;
    pub const EVERYWHERE: u8 = 0x80;
}

struct Line {
    bytes: [u8; 8],
}

pub struct ParserTables {
    /// Action routine atoms, index = action number.
    pub actions: Vec<Atom>,
    /// Preaction routine per action number.
    pub preactions: Vec<Option<Atom>>,
    /// Printable names for diagnostics, captured at build time.
    action_names: Vec<String>,
    preaction_names: Vec<Option<String>>,
    /// Per verb (in `Dictionary::verbs` order), the verb's lines.
    lines: Vec<Vec<Line>>,
    /// `(constant name, action number)` pairs to inject as symbols.
    pub action_constants: Vec<(Atom, u16)>,
}

impl ParserTables {
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Region size: ACTIONS + PREACTIONS + VERBS + line blocks.
    pub fn byte_size(&self) -> u32 {
        let words = 2 * (2 * self.actions.len() + self.lines.len()) as u32;
        let blocks: u32 = self.lines.iter().map(|l| 1 + 8 * l.len() as u32).sum();
        words + blocks
    }

    /// Emit the whole region given its base address. Routine references
    /// become fixups against [`Region::ParserTables`].
    pub fn emit(
        &self,
        base: u16,
        world: &World,
        diag: &mut Diagnostics,
        fixups: &mut Vec<Fixup>,
    ) -> CompileResult<ParserRegion> {
        let mut out = Vec::with_capacity(self.byte_size() as usize);

        let mut push_routine =
            |out: &mut Vec<u8>, fixups: &mut Vec<Fixup>, routine: Option<(Atom, &str)>, what: &str|
             -> CompileResult<()> {
                match routine.map(|(r, name)| (name, world.lookup(r))) {
                    Some((_, Some(Sym::Routine(id)))) => {
                        fixups.push(Fixup {
                            region: Region::ParserTables,
                            offset: out.len() as u32,
                            kind: RefKind::Routine,
                            index: id.as_u32(),
                        });
                        let p = RefKind::Routine.placeholder(id.as_u32());
                        out.extend_from_slice(&p.to_be_bytes());
                    }
                    Some((name, _)) => {
                        diag.warn(None, format!("{what} routine {name} is not defined"))?;
                        out.extend_from_slice(&[0, 0]);
                    }
                    None => out.extend_from_slice(&[0, 0]),
                }
                Ok(())
            };

        let actions_base = base;
        for (&a, name) in self.actions.iter().zip(&self.action_names) {
            push_routine(&mut out, fixups, Some((a, name)), "action")?;
        }
        let preactions_base = base + out.len() as u16;
        for (&p, name) in self.preactions.iter().zip(&self.preaction_names) {
            let arg = p.zip(name.as_deref());
            push_routine(&mut out, fixups, arg, "preaction")?;
        }

        let verbs_base = base + out.len() as u16;
        let blocks_start = out.len() + 2 * self.lines.len();
        let mut block_off = blocks_start as u16;
        for lines in &self.lines {
            out.extend_from_slice(&(base + block_off).to_be_bytes());
            block_off += 1 + 8 * lines.len() as u16;
        }
        for lines in &self.lines {
            out.push(lines.len() as u8);
            for line in lines {
                out.extend_from_slice(&line.bytes);
            }
        }
        debug_assert_eq!(out.len() as u32, self.byte_size());

        Ok(ParserRegion { bytes: out, actions_base, preactions_base, verbs_base })
    }
}

pub struct ParserRegion {
    pub bytes: Vec<u8>,
    pub actions_base: u16,
    pub preactions_base: u16,
    pub verbs_base: u16,
}

/// Number the actions and flatten every syntax line to bytes.
pub fn build(
    program: &Program,
    world: &World,
    dict: &Dictionary,
    interner: &mut Interner,
    diag: &mut Diagnostics,
) -> CompileResult<ParserTables> {
    let mut actions: Vec<Atom> = Vec::new();
    let mut preactions: Vec<Option<Atom>> = Vec::new();
    let mut action_ids: FxHashMap<Atom, u8> = FxHashMap::default();
    let mut lines: Vec<Vec<Line>> = (0..dict.verbs.len()).map(|_| Vec::new()).collect();

    let opt_bits: [(Atom, u8); 8] = [
        (interner.intern("HELD"), opts::HELD),
        (interner.intern("CARRIED"), opts::CARRIED),
        (interner.intern("ON-GROUND"), opts::ON_GROUND),
        (interner.intern("IN-ROOM"), opts::IN_ROOM),
        (interner.intern("MANY"), opts::MANY),
        (interner.intern("HAVE"), opts::HAVE),
        (interner.intern("TAKE"), opts::TAKE),
        (interner.intern("EVERYWHERE"), opts::EVERYWHERE),
    ];

    for syntax in &program.syntaxes {
        let action = match action_ids.get(&syntax.action) {
            Some(&n) => n,
            None => {
                if actions.len() == 255 {
                    return Err(CompileError::Semantic {
                        loc: syntax.loc.clone(),
                        message: "more than 255 actions".into(),
                    });
                }
                let n = actions.len() as u8;
                actions.push(syntax.action);
                preactions.push(syntax.preaction);
                action_ids.insert(syntax.action, n);
                n
            }
        };
        if let Some(pre) = syntax.preaction {
            let slot = &mut preactions[action as usize];
            match slot {
                None => *slot = Some(pre),
                Some(p) if *p != pre => diag.warn(
                    Some(syntax.loc.clone()),
                    format!(
                        "conflicting preactions for {}; keeping {}",
                        interner.name(syntax.action),
                        interner.name(*p)
                    ),
                )?,
                _ => {}
            }
        }

        let mut bytes = [0u8; 8];
        bytes[0] = syntax.slots.len() as u8;
        for (i, slot) in syntax.slots.iter().enumerate().take(2) {
            let at = 1 + i * 3;
            if let Some(prep) = slot.prep {
                bytes[at] = dict.prep_id(prep).ok_or_else(|| CompileError::Semantic {
                    loc: syntax.loc.clone(),
                    message: format!("preposition {} missing from vocabulary", interner.name(prep)),
                })?;
            }
            if let Some(flag) = slot.find_flag {
                let id = world.flag_id(flag).ok_or_else(|| CompileError::Semantic {
                    loc: syntax.loc.clone(),
                    message: format!("FIND flag {} is not defined", interner.name(flag)),
                })?;
                bytes[at + 1] = id + 1;
            }
            for &opt in &slot.options {
                match opt_bits.iter().find(|&&(a, _)| a == opt) {
                    Some(&(_, bit)) => bytes[at + 2] |= bit,
                    None => diag.warn(
                        Some(syntax.loc.clone()),
                        format!("unknown syntax option {}", interner.name(opt)),
                    )?,
                }
            }
        }
        bytes[7] = action;

        let verb_index = dict
            .verbs
            .iter()
            .position(|&v| v == syntax.verb)
            .expect("verb registered during dictionary build");
        lines[verb_index].push(Line { bytes });
    }

    // `V?FOO` / `ACT?FOO` constants for a routine named `V-FOO`,
    // `ACT?<name>` otherwise.
    let mut action_constants = Vec::new();
    for (n, &a) in actions.iter().enumerate() {
        let name = interner.name(a).to_owned();
        let stem = name.strip_prefix("V-").unwrap_or(&name).to_owned();
        action_constants.push((interner.intern(&format!("ACT?{stem}")), n as u16));
        if name.starts_with("V-") {
            action_constants.push((interner.intern(&format!("V?{stem}")), n as u16));
        }
    }

    debug!(
        "parser tables: {} action(s), {} verb(s), {} syntax line(s)",
        actions.len(),
        dict.verbs.len(),
        program.syntaxes.len()
    );
    let action_names = actions.iter().map(|&a| interner.name(a).to_owned()).collect();
    let preaction_names = preactions
        .iter()
        .map(|p| p.map(|a| interner.name(a).to_owned()))
        .collect();
    Ok(ParserTables {
        actions,
        preactions,
        action_names,
        preaction_names,
        lines,
        action_constants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use zilc_frontend::decl::recognize;
    use zilc_frontend::expand::Expander;
    use zilc_frontend::parser::Parser;
    use zilc_frontend::preprocess::SourceMap;
    use zilc_zmachine::ZVersion;

    fn tables(src: &str) -> (ParserTables, Dictionary, World, Interner, Diagnostics) {
        let map = SourceMap::single_file("t.zil", src);
        let mut interner = Interner::new();
        let tops = Parser::new(src, &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        let tops = Expander::new(&mut interner).expand_program(tops, &map).unwrap();
        let program = recognize(tops, &mut interner, &map).unwrap();
        let mut diag = Diagnostics::new(100);
        let world =
            crate::symbols::build(&program, ZVersion::V3, &mut interner, &mut diag).unwrap();
        let dict = crate::dictionary::build(&program, &world, &mut interner, &mut diag).unwrap();
        let pt = build(&program, &world, &dict, &mut interner, &mut diag).unwrap();
        (pt, dict, world, interner, diag)
    }

    #[test]
    fn actions_number_in_first_use_order() {
        let (pt, _, _, mut i, _) = tables(
            "<SYNTAX TAKE OBJECT = V-TAKE> <SYNTAX DROP OBJECT = V-DROP> \
             <SYNTAX GET OBJECT = V-TAKE> \
             <ROUTINE V-TAKE () <RTRUE>> <ROUTINE V-DROP () <RTRUE>>",
        );
        assert_eq!(pt.actions.len(), 2);
        assert_eq!(pt.actions[0], i.intern("V-TAKE"));
        assert_eq!(pt.actions[1], i.intern("V-DROP"));
        // ACT?TAKE and V?TAKE both exist.
        assert!(pt.action_constants.iter().any(|&(a, n)| a == i.intern("ACT?TAKE") && n == 0));
        assert!(pt.action_constants.iter().any(|&(a, n)| a == i.intern("V?TAKE") && n == 0));
    }

    #[test]
    fn line_bytes_carry_preps_finds_and_options() {
        let (pt, dict, world, mut i, _) = tables(
            "<SYNTAX PUT OBJECT (FIND TAKEBIT) (MANY) IN OBJECT (HAVE) = V-PUT-IN> \
             <OBJECT BOX (FLAGS TAKEBIT CONTBIT)> <ROUTINE V-PUT-IN () <RTRUE>>",
        );
        let mut fixups = Vec::new();
        let mut diag = Diagnostics::new(100);
        let region = pt.emit(0x1000, &world, &mut diag, &mut fixups).unwrap();
        // One action, one verb: actions at base, preactions next,
        // verbs table after, then the block.
        assert_eq!(region.actions_base, 0x1000);
        assert_eq!(region.preactions_base, 0x1002);
        assert_eq!(region.verbs_base, 0x1004);
        // The verb pointer points just past itself.
        assert_eq!(&region.bytes[4..6], &0x1006u16.to_be_bytes());
        // Block: 1 line.
        let line = &region.bytes[7..15];
        assert_eq!(line[0], 2); // two objects
        assert_eq!(line[2], world.flag_id(i.intern("TAKEBIT")).unwrap() + 1);
        assert_eq!(line[3], opts::MANY);
        assert_eq!(line[4], dict.prep_id(i.intern("IN")).unwrap());
        assert_eq!(line[6], opts::HAVE);
        assert_eq!(line[7], 0);
        // The action slot got a routine fixup.
        assert_eq!(fixups.len(), 1);
        assert_eq!(fixups[0].offset, 0);
    }

    #[test]
    fn missing_action_routine_warns_and_zeroes() {
        let (pt, _, world, _i, _) = tables("<SYNTAX JUMP = V-JUMP>");
        let mut fixups = Vec::new();
        let mut diag = Diagnostics::new(100);
        let region = pt.emit(0x2000, &world, &mut diag, &mut fixups).unwrap();
        assert_eq!(&region.bytes[0..2], &[0, 0]);
        assert!(fixups.is_empty());
        assert_eq!(diag.len(), 1);
    }
}
