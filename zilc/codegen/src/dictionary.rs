//! The dictionary builder.
//!
//! Vocabulary comes from syntax verbs, prepositions in syntax patterns,
//! object `SYNONYM`/`ADJECTIVE` lists, `BUZZ` words, directions, and
//! top-level `SYNONYM` aliases. Entries are sorted by the unsigned
//! comparison of their encoded bytes, as interpreters expect for binary
//! search; words whose encodings collide after truncation merge into
//! one entry with a warning.

use log::debug;
use rustc_hash::FxHashMap;

use zilc_frontend::decl::{Program, VocabKind};
use zilc_frontend::intern::{Atom, Interner};
use zilc_frontend::value::Value;
use zilc_zmachine::text::encode_dict_word;
use zilc_zmachine::ZVersion;

use crate::result::{CompileError, CompileResult, Diagnostics};
use crate::symbols::World;

/// Part-of-speech flag bits in a dictionary entry's first data byte.
pub mod flags {
    pub const VERB: u8 = 0x01;
    pub const BUZZ: u8 = 0x04;
    pub const PREPOSITION: u8 = 0x08;
    pub const DIRECTION: u8 = 0x10;
    pub const ADJECTIVE: u8 = 0x20;
    pub const NOUN: u8 = 0x80;
}

/// Word separators recognized by `read`: period, comma, double-quote.
pub const SEPARATORS: [u8; 3] = [b'.', b',', b'"'];

#[derive(Clone, Debug, Default)]
struct Senses {
    flags: u8,
    verb: Option<u8>,
    prep: Option<u8>,
    adj: Option<u8>,
    dir: Option<u8>,
}

impl Senses {
    fn data_bytes(&self) -> [u8; 2] {
        let mut out = [0u8; 2];
        let mut slot = 0;
        for id in [self.verb, self.adj, self.prep, self.dir].into_iter().flatten() {
            if slot == 2 {
                break;
            }
            out[slot] = id;
            slot += 1;
        }
        out
    }
}

#[derive(Clone, Debug)]
pub struct WordEntry {
    pub atom: Atom,
    pub encoded: Vec<u8>,
    pub flags: u8,
    pub data: [u8; 2],
}

pub struct Dictionary {
    /// Sorted by encoded bytes.
    pub entries: Vec<WordEntry>,
    index: FxHashMap<Atom, usize>,
    /// Words merged away by truncation, with their surviving position.
    aliases: Vec<(Atom, usize)>,
    /// Verb words in id-assignment order; id = 255 − index.
    pub verbs: Vec<Atom>,
    /// Prepositions in id-assignment order; id = 255 − index.
    pub preps: Vec<Atom>,
    entry_len: usize,
    text_len: usize,
}

impl Dictionary {
    pub fn verb_id(&self, atom: Atom) -> Option<u8> {
        self.verbs.iter().position(|&v| v == atom).map(|i| 255 - i as u8)
    }

    pub fn prep_id(&self, atom: Atom) -> Option<u8> {
        self.preps.iter().position(|&p| p == atom).map(|i| 255 - i as u8)
    }

    /// Sorted position of a word, if it is in the vocabulary.
    pub fn position(&self, atom: Atom) -> Option<usize> {
        self.index.get(&atom).copied()
    }

    /// Every addressable word with its sorted position, in a
    /// deterministic order: entries first, merged aliases after.
    pub fn words(&self) -> impl Iterator<Item = (Atom, usize)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.atom, i))
            .chain(self.aliases.iter().copied())
    }

    /// Size of the emitted dictionary in bytes.
    pub fn byte_size(&self) -> u32 {
        (self.header_size() + self.entries.len() * self.entry_len) as u32
    }

    fn header_size(&self) -> usize {
        1 + SEPARATORS.len() + 1 + 2
    }

    /// Byte address of a word's entry given the dictionary base.
    pub fn address_of(&self, atom: Atom, base: u16) -> Option<u16> {
        let i = self.position(atom)?;
        Some(base + (self.header_size() + i * self.entry_len) as u16)
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_size() as usize);
        out.push(SEPARATORS.len() as u8);
        out.extend_from_slice(&SEPARATORS);
        out.push(self.entry_len as u8);
        out.extend_from_slice(&(self.entries.len() as i16).to_be_bytes());
        for e in &self.entries {
            out.extend_from_slice(&e.encoded);
            out.push(e.flags);
            out.extend_from_slice(&e.data);
            debug_assert_eq!(self.text_len + 3, self.entry_len);
        }
        out
    }
}

/// Collect, number and sort the vocabulary.
pub fn build(
    program: &Program,
    world: &World,
    interner: &mut Interner,
    diag: &mut Diagnostics,
) -> CompileResult<Dictionary> {
    let version = world.version;
    let synonym_head = interner.intern("SYNONYM");
    let adjective_head = interner.intern("ADJECTIVE");

    let mut order: Vec<Atom> = Vec::new();
    let mut senses: FxHashMap<Atom, Senses> = FxHashMap::default();
    let mut verbs: Vec<Atom> = Vec::new();
    let mut preps: Vec<Atom> = Vec::new();
    let mut adjectives: Vec<Atom> = Vec::new();

    let mut touch = |order: &mut Vec<Atom>, senses: &mut FxHashMap<Atom, Senses>, w: Atom| {
        if !senses.contains_key(&w) {
            order.push(w);
            senses.insert(w, Senses::default());
        }
    };

    // Verbs and prepositions, in syntax order.
    for syntax in &program.syntaxes {
        touch(&mut order, &mut senses, syntax.verb);
        if !verbs.contains(&syntax.verb) {
            if verbs.len() == 255 {
                return Err(CompileError::Semantic {
                    loc: syntax.loc.clone(),
                    message: "more than 255 verbs".into(),
                });
            }
            verbs.push(syntax.verb);
        }
        let s = senses.get_mut(&syntax.verb).unwrap();
        s.flags |= flags::VERB;
        s.verb = Some(255 - (verbs.iter().position(|&v| v == syntax.verb).unwrap() as u8));
        for slot in &syntax.slots {
            if let Some(prep) = slot.prep {
                touch(&mut order, &mut senses, prep);
                if !preps.contains(&prep) {
                    preps.push(prep);
                }
                let s = senses.get_mut(&prep).unwrap();
                s.flags |= flags::PREPOSITION;
                s.prep = Some(255 - (preps.iter().position(|&p| p == prep).unwrap() as u8));
            }
        }
    }

    // Object nouns and adjectives, in source order.
    for def in &program.objects {
        for (head, values) in &def.props {
            let is_noun = *head == synonym_head;
            let is_adj = *head == adjective_head;
            if !is_noun && !is_adj {
                continue;
            }
            for v in values {
                let Some(w) = v.as_atom() else {
                    return Err(CompileError::Semantic {
                        loc: def.loc.clone(),
                        message: "object vocabulary words must be atoms".into(),
                    });
                };
                touch(&mut order, &mut senses, w);
                let s = senses.get_mut(&w).unwrap();
                if is_noun {
                    s.flags |= flags::NOUN;
                } else {
                    s.flags |= flags::ADJECTIVE;
                    if version == ZVersion::V3 {
                        if !adjectives.contains(&w) {
                            adjectives.push(w);
                        }
                        s.adj = Some(
                            255 - (adjectives.iter().position(|&a| a == w).unwrap() as u8),
                        );
                    }
                }
            }
        }
    }

    // Directions and their property numbers.
    for &(dir, prop) in &world.directions {
        touch(&mut order, &mut senses, dir);
        let s = senses.get_mut(&dir).unwrap();
        s.flags |= flags::DIRECTION;
        s.dir = Some(prop);
    }

    // Top-level vocabulary declarations.
    for decl in &program.vocab {
        match decl.kind {
            VocabKind::Buzz => {
                for &w in &decl.words {
                    touch(&mut order, &mut senses, w);
                    senses.get_mut(&w).unwrap().flags |= flags::BUZZ;
                }
            }
            VocabKind::Adjective => {
                for &w in &decl.words {
                    touch(&mut order, &mut senses, w);
                    let s = senses.get_mut(&w).unwrap();
                    s.flags |= flags::ADJECTIVE;
                    if version == ZVersion::V3 && s.adj.is_none() {
                        if !adjectives.contains(&w) {
                            adjectives.push(w);
                        }
                        s.adj =
                            Some(255 - (adjectives.iter().position(|&a| a == w).unwrap() as u8));
                    }
                }
            }
            VocabKind::Preposition => {
                for &w in &decl.words {
                    touch(&mut order, &mut senses, w);
                    if !preps.contains(&w) {
                        preps.push(w);
                    }
                    let s = senses.get_mut(&w).unwrap();
                    s.flags |= flags::PREPOSITION;
                    s.prep = Some(255 - (preps.iter().position(|&p| p == w).unwrap() as u8));
                }
            }
            VocabKind::Synonym => {
                // `<SYNONYM WORD ALIAS…>`: aliases share the senses the
                // base word has accumulated so far.
                let Some((&base, aliases)) = decl.words.split_first() else { continue };
                let base_senses = senses.get(&base).cloned().unwrap_or_else(|| {
                    Senses { flags: flags::NOUN, ..Senses::default() }
                });
                touch(&mut order, &mut senses, base);
                if senses[&base].flags == 0 {
                    senses.get_mut(&base).unwrap().flags = base_senses.flags;
                }
                for &alias in aliases {
                    touch(&mut order, &mut senses, alias);
                    *senses.get_mut(&alias).unwrap() = base_senses.clone();
                }
            }
        }
    }

    // Encode, merge truncation collisions, sort.
    let mut entries: Vec<WordEntry> = Vec::with_capacity(order.len());
    let mut by_encoding: FxHashMap<Vec<u8>, usize> = FxHashMap::default();
    let mut aliases: Vec<(Atom, usize)> = Vec::new();
    for w in order {
        let s = &senses[&w];
        let encoded = encode_dict_word(interner.name(w), version).map_err(|source| {
            CompileError::Encoding { loc: Default::default(), source }
        })?;
        if let Some(&i) = by_encoding.get(&encoded) {
            if entries[i].atom != w {
                diag.warn(
                    None,
                    format!(
                        "vocabulary words {} and {} encode identically; merging",
                        interner.name(entries[i].atom),
                        interner.name(w)
                    ),
                )?;
            }
            entries[i].flags |= s.flags;
            aliases.push((w, i));
            continue;
        }
        by_encoding.insert(encoded.clone(), entries.len());
        entries.push(WordEntry { atom: w, encoded, flags: s.flags, data: s.data_bytes() });
    }

    // Sort and rebuild positions; merged aliases resolve to the entry
    // that survived.
    let before: Vec<Atom> = entries.iter().map(|e| e.atom).collect();
    entries.sort_by(|a, b| a.encoded.cmp(&b.encoded));
    let mut index = FxHashMap::default();
    for (i, e) in entries.iter().enumerate() {
        index.insert(e.atom, i);
    }
    let aliases: Vec<(Atom, usize)> = aliases
        .into_iter()
        .map(|(alias, old)| (alias, index[&before[old]]))
        .collect();
    for &(alias, target) in &aliases {
        index.insert(alias, target);
    }
    let text_len = version.dict_text_bytes();
    debug!("dictionary: {} entries of {} bytes", entries.len(), text_len + 3);

    Ok(Dictionary { entries, index, aliases, verbs, preps, entry_len: text_len + 3, text_len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Diagnostics;
    use zilc_frontend::decl::recognize;
    use zilc_frontend::expand::Expander;
    use zilc_frontend::parser::Parser;
    use zilc_frontend::preprocess::SourceMap;

    fn dict(src: &str) -> (Dictionary, Interner) {
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
        let d = build(&program, &world, &mut interner, &mut diag).unwrap();
        (d, interner)
    }

    #[test]
    fn words_sort_by_encoding() {
        let (d, mut i) = dict(
            "<OBJECT A (SYNONYM ZEBRA)> <OBJECT B (SYNONYM APPLE)> <OBJECT C (SYNONYM MANGO)>",
        );
        let names: Vec<&str> = d.entries.iter().map(|e| i.name(e.atom)).collect();
        assert_eq!(names, vec!["APPLE", "MANGO", "ZEBRA"]);
        let _ = i.intern("APPLE");
    }

    #[test]
    fn verb_ids_descend_from_255() {
        let (d, mut i) = dict(
            "<SYNTAX TAKE OBJECT = V-TAKE> <SYNTAX DROP OBJECT = V-DROP> \
             <ROUTINE V-TAKE () <RTRUE>> <ROUTINE V-DROP () <RTRUE>>",
        );
        assert_eq!(d.verb_id(i.intern("TAKE")), Some(255));
        assert_eq!(d.verb_id(i.intern("DROP")), Some(254));
        let take = &d.entries[d.position(i.intern("TAKE")).unwrap()];
        assert_eq!(take.flags & flags::VERB, flags::VERB);
        assert_eq!(take.data[0], 255);
    }

    #[test]
    fn emitted_header_shape() {
        let (d, _) = dict("<OBJECT A (SYNONYM LAMP)>");
        let bytes = d.emit();
        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..4], &[b'.', b',', b'"']);
        assert_eq!(bytes[4], 7); // V3: 4 text + 3 data
        assert_eq!(&bytes[5..7], &[0, 1]);
        assert_eq!(bytes.len(), 7 + 7);
    }

    #[test]
    fn truncation_collisions_merge() {
        let (d, mut i) = dict(
            "<OBJECT A (SYNONYM LANTERN)> <BUZZ LANTERNS>",
        );
        // Both encode to "lanter" in V3.
        assert_eq!(d.entries.len(), 1);
        let e = &d.entries[0];
        assert_eq!(e.flags & flags::NOUN, flags::NOUN);
        assert_eq!(e.flags & flags::BUZZ, flags::BUZZ);
        let _ = i.intern("LANTERN");
    }

    #[test]
    fn entries_strictly_ascend() {
        let (d, _) = dict(
            "<SYNTAX LOOK = V-LOOK> <OBJECT A (SYNONYM LAMP POLE) (ADJECTIVE BRASS)> \
             <BUZZ THE AN> <ROUTINE V-LOOK () <RTRUE>>",
        );
        for pair in d.entries.windows(2) {
            assert!(pair[0].encoded < pair[1].encoded);
        }
    }
}
