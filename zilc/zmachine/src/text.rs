//! ZSCII to Z-character text encoding.
//!
//! Strings are encoded as 5-bit Z-characters, three to a 16-bit word,
//! with the top bit of the final word marking end-of-string. Characters
//! outside the three alphabets use the A2 escape (Z-char 6) followed by
//! two 5-bit halves of a 10-bit ZSCII code. See sections 3.2-3.8 of the
//! Standards Document.

use smallvec::SmallVec;
use thiserror::Error;

use crate::version::{ZVersion, MAX_ABBREVS};

/// Alphabet A0: Z-chars 6..=31.
const A0: &[u8; 26] = b"abcdefghijklmnopqrstuvwxyz";
/// Alphabet A1: Z-chars 6..=31.
const A1: &[u8; 26] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
/// Alphabet A2: Z-chars 7..=31. Z-char 6 of A2 is the 10-bit escape.
const A2: &[u8; 25] = b"\n0123456789.,!?_#'\"/\\-:()";

/// The ZSCII code emitted for `|` in source strings; interpreters print
/// it as a newline. Overridable via `CRLF-CHARACTER`.
pub const DEFAULT_NEWLINE_ZSCII: u8 = 13;

/// Z-char used to pad the last word of an encoded string.
const PAD: u8 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextError {
    #[error("character {0:?} has no ZSCII encoding")]
    Unrepresentable(char),
    #[error("abbreviation index {0} out of range")]
    BadAbbrev(usize),
}

/// Options threaded through encoding.
#[derive(Copy, Clone, Debug)]
pub struct EncodeOpts {
    /// Suppress the period-space-space collapse (`PRESERVE-SPACES?`).
    pub preserve_spaces: bool,
    /// Encoding the text *of* an abbreviation: no substitution, and
    /// spacing is kept exactly.
    pub literal: bool,
    /// ZSCII code substituted for `|` newlines.
    pub newline_zscii: u8,
}

impl Default for EncodeOpts {
    fn default() -> Self {
        EncodeOpts {
            preserve_spaces: false,
            literal: false,
            newline_zscii: DEFAULT_NEWLINE_ZSCII,
        }
    }
}

/// An abbreviations table: up to 96 strings, referenced from encoded text
/// by Z-chars 1-3.
#[derive(Clone, Debug, Default)]
pub struct AbbrevTable {
    entries: Vec<String>,
}

impl AbbrevTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of abbreviations defined.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an abbreviation, returning its index, or `None` if the table
    /// is full.
    pub fn push(&mut self, text: &str) -> Option<usize> {
        if self.entries.len() >= MAX_ABBREVS {
            return None;
        }
        self.entries.push(text.to_owned());
        Some(self.entries.len() - 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    fn get(&self, index: usize) -> Result<&str, TextError> {
        self.entries
            .get(index)
            .map(String::as_str)
            .ok_or(TextError::BadAbbrev(index))
    }

    /// Longest abbreviation matching a prefix of `s`, as (index, length).
    fn longest_match(&self, s: &str) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for (i, a) in self.entries.iter().enumerate() {
            if !a.is_empty() && s.starts_with(a.as_str()) {
                match best {
                    Some((_, len)) if len >= a.len() => {}
                    _ => best = Some((i, a.len())),
                }
            }
        }
        best
    }
}

fn alphabet_pos(table: &[u8], ch: char) -> Option<u8> {
    if !ch.is_ascii() {
        return None;
    }
    table.iter().position(|&c| c as char == ch).map(|p| p as u8)
}

/// ZSCII code for a source character, or an error when there is none.
/// Plain ASCII passes through; everything else is rejected here rather
/// than silently mangled.
fn zscii_of(ch: char, opts: &EncodeOpts) -> Result<u16, TextError> {
    match ch {
        '\n' => Ok(u16::from(opts.newline_zscii)),
        c if (' '..='~').contains(&c) => Ok(c as u16),
        c => Err(TextError::Unrepresentable(c)),
    }
}

/// The period-space-space collapse: `".  "` becomes `". "`. Idempotent.
fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c == '.' && chars.peek() == Some(&' ') {
            out.push(chars.next().unwrap());
            while chars.peek() == Some(&' ') {
                chars.next();
            }
        }
    }
    out
}

/// Translate one character to Z-characters, appending to `out`.
fn push_char(out: &mut Vec<u8>, ch: char, opts: &EncodeOpts) -> Result<(), TextError> {
    if ch == ' ' {
        out.push(0);
        return Ok(());
    }
    if ch != '\n' {
        if let Some(p) = alphabet_pos(A0, ch) {
            out.push(p + 6);
            return Ok(());
        }
        if let Some(p) = alphabet_pos(A1, ch) {
            out.push(4);
            out.push(p + 6);
            return Ok(());
        }
        if let Some(p) = alphabet_pos(A2, ch) {
            out.push(5);
            out.push(p + 7);
            return Ok(());
        }
    } else if opts.newline_zscii == DEFAULT_NEWLINE_ZSCII {
        // ZSCII 13 sits in A2 at Z-char 7.
        out.push(5);
        out.push(7);
        return Ok(());
    }
    // 10-bit escape: shift to A2, Z-char 6, then two halves.
    let code = zscii_of(ch, opts)?;
    out.push(5);
    out.push(6);
    out.push(((code >> 5) & 0x1F) as u8);
    out.push((code & 0x1F) as u8);
    Ok(())
}

/// Translate a whole string to unpacked Z-characters, substituting
/// abbreviations greedily when a table is supplied.
fn to_zchars(
    s: &str,
    abbrevs: Option<&AbbrevTable>,
    opts: &EncodeOpts,
) -> Result<Vec<u8>, TextError> {
    let collapsed;
    let mut rest = if opts.preserve_spaces || opts.literal {
        s
    } else {
        collapsed = collapse_spaces(s);
        &collapsed
    };

    let mut out = Vec::with_capacity(rest.len() + rest.len() / 2);
    while !rest.is_empty() {
        if !opts.literal {
            if let Some((index, len)) = abbrevs.and_then(|t| t.longest_match(rest)) {
                out.push(1 + (index / 32) as u8);
                out.push((index % 32) as u8);
                rest = &rest[len..];
                continue;
            }
        }
        let ch = rest.chars().next().unwrap();
        push_char(&mut out, ch, opts)?;
        rest = &rest[ch.len_utf8()..];
    }
    Ok(out)
}

/// Pack Z-characters three to a word, set the end bit on the last word.
fn pack(zchars: &[u8]) -> Vec<u8> {
    let mut padded: SmallVec<[u8; 24]> = SmallVec::from_slice(zchars);
    while padded.is_empty() || padded.len() % 3 != 0 {
        padded.push(PAD);
    }
    let mut out = Vec::with_capacity(padded.len() / 3 * 2);
    for (i, tri) in padded.chunks_exact(3).enumerate() {
        let mut w = (u16::from(tri[0]) << 10) | (u16::from(tri[1]) << 5) | u16::from(tri[2]);
        if i == padded.len() / 3 - 1 {
            w |= 0x8000;
        }
        out.push((w >> 8) as u8);
        out.push(w as u8);
    }
    out
}

/// Encode a string for in-game printing.
pub fn encode(
    s: &str,
    _version: ZVersion,
    abbrevs: Option<&AbbrevTable>,
    opts: &EncodeOpts,
) -> Result<Vec<u8>, TextError> {
    Ok(pack(&to_zchars(s, abbrevs, opts)?))
}

/// Encode a dictionary word: lowercased, truncated or padded to exactly
/// the version's resolution, never abbreviated.
pub fn encode_dict_word(word: &str, version: ZVersion) -> Result<Vec<u8>, TextError> {
    let lowered = word.to_ascii_lowercase();
    let opts = EncodeOpts { literal: true, ..EncodeOpts::default() };
    let mut zchars = to_zchars(&lowered, None, &opts)?;
    let n = version.dict_word_zchars();
    zchars.truncate(n);
    while zchars.len() < n {
        zchars.push(PAD);
    }
    Ok(pack(&zchars))
}

/// Decode packed text. Exercised by the round-trip tests; the compiler
/// proper never reads encoded strings back.
pub fn decode(
    bytes: &[u8],
    _version: ZVersion,
    abbrevs: Option<&AbbrevTable>,
) -> Result<String, TextError> {
    let mut zchars = Vec::new();
    for pair in bytes.chunks_exact(2) {
        let w = (u16::from(pair[0]) << 8) | u16::from(pair[1]);
        zchars.push(((w >> 10) & 0x1F) as u8);
        zchars.push(((w >> 5) & 0x1F) as u8);
        zchars.push((w & 0x1F) as u8);
        if w & 0x8000 != 0 {
            break;
        }
    }

    let mut out = String::new();
    let mut i = 0;
    let mut alpha = 0u8;
    while i < zchars.len() {
        let z = zchars[i];
        i += 1;
        match z {
            0 => out.push(' '),
            1..=3 => {
                if i < zchars.len() {
                    let index = 32 * usize::from(z - 1) + usize::from(zchars[i]);
                    i += 1;
                    if let Some(t) = abbrevs {
                        out.push_str(t.get(index)?);
                    }
                }
            }
            4 => alpha = 1,
            5 => alpha = 2,
            6 if alpha == 2 => {
                if i + 1 < zchars.len() {
                    let code = (u16::from(zchars[i]) << 5) | u16::from(zchars[i + 1]);
                    i += 2;
                    match code {
                        13 => out.push('\n'),
                        32..=126 => out.push(code as u8 as char),
                        _ => {}
                    }
                }
                alpha = 0;
            }
            z => {
                let ch = match alpha {
                    0 => A0[usize::from(z) - 6] as char,
                    1 => A1[usize::from(z) - 6] as char,
                    _ => A2[usize::from(z) - 7] as char,
                };
                out.push(ch);
                alpha = 0;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ZVersion::V3;

    fn enc(s: &str) -> Vec<u8> {
        encode(s, V3, None, &EncodeOpts::default()).unwrap()
    }

    #[test]
    fn hand_packed_words() {
        // "abc" = zchars 6,7,8 = 0b0_00110_00111_01000 | end bit.
        assert_eq!(enc("abc"), vec![0x98, 0xE8]);
        // Empty string is one word of pad characters.
        assert_eq!(enc(""), vec![0x94, 0xA5]);
        // A space is Z-char 0.
        assert_eq!(enc(" ")[0] & 0x7C, 0x00);
    }

    #[test]
    fn end_bit_only_on_last_word() {
        let bytes = enc("abcdef");
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes[0] & 0x80, 0);
        assert_ne!(bytes[2] & 0x80, 0);
    }

    #[test]
    fn shifts_and_escape() {
        // 'A' needs a single shift to A1.
        assert_eq!(enc("A"), pack(&[4, 6]).to_vec());
        // '0' lives in A2.
        assert_eq!(enc("0"), pack(&[5, 8]).to_vec());
        // '%' is in no alphabet: 10-bit escape, 0x25 = 1,5.
        assert_eq!(enc("%"), pack(&[5, 6, 1, 5]).to_vec());
    }

    #[test]
    fn rejects_non_ascii() {
        let e = encode("caf\u{e9}", V3, None, &EncodeOpts::default());
        assert_eq!(e.unwrap_err(), TextError::Unrepresentable('\u{e9}'));
    }

    #[test]
    fn space_collapse_is_idempotent() {
        assert_eq!(collapse_spaces("End.  Next"), "End. Next");
        assert_eq!(collapse_spaces("End. Next"), "End. Next");
        assert_eq!(collapse_spaces(collapse_spaces("a.   b").as_str()), "a. b");
        // Preserved when asked.
        let opts = EncodeOpts { preserve_spaces: true, ..EncodeOpts::default() };
        let kept = encode("a.  b", V3, None, &opts).unwrap();
        assert_ne!(kept, enc("a.  b"));
    }

    #[test]
    fn roundtrip() {
        for s in ["Hello, World!", "x", "", "It is pitch black.", "a|b"] {
            let src = s.replace('|', "\n");
            let bytes = enc(&src);
            assert_eq!(decode(&bytes, V3, None).unwrap(), src);
        }
    }

    #[test]
    fn abbreviation_substitution() {
        let mut t = AbbrevTable::new();
        let the = t.push("the ").unwrap();
        t.push("and ").unwrap();
        assert_eq!(the, 0);
        let bytes = encode("the lamp", V3, Some(&t), &EncodeOpts::default()).unwrap();
        // First pair must be the abbreviation reference: trigger 1, index 0.
        let w = (u16::from(bytes[0]) << 8) | u16::from(bytes[1]);
        assert_eq!((w >> 10) & 0x1F, 1);
        assert_eq!((w >> 5) & 0x1F, 0);
        assert_eq!(decode(&bytes, V3, Some(&t)).unwrap(), "the lamp");
    }

    #[test]
    fn longest_abbreviation_wins() {
        let mut t = AbbrevTable::new();
        t.push("over").unwrap();
        t.push("overhead").unwrap();
        assert_eq!(t.longest_match("overhead light"), Some((1, 8)));
    }

    #[test]
    fn dict_words_are_fixed_width() {
        let short = encode_dict_word("go", V3).unwrap();
        assert_eq!(short.len(), 4);
        let long = encode_dict_word("lantern", V3).unwrap();
        // Truncated to 6 zchars: "lanter".
        assert_eq!(long.len(), 4);
        assert_eq!(long, encode_dict_word("LANTERns", V3).unwrap());
        assert_eq!(encode_dict_word("lantern", ZVersion::V5).unwrap().len(), 6);
    }
}
