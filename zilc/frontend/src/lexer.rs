//! The lexer.
//!
//! Mostly conventional, with one genuinely tricky rule: `;`. Inside a
//! parenthesized list, a `;` not followed by a comment opener acts as a
//! separator token (ZILF's alternate-group marker in vocabulary lists);
//! everywhere else it introduces a comment that swallows exactly one
//! following datum.

use crate::error::FrontendError;
use crate::preprocess::{raw_datum_end, SourceMap};

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    LAngle,
    RAngle,
    LParen,
    RParen,
    LBracket,
    RBracket,
    /// `.`, the local-variable prefix.
    Dot,
    /// `,`, the global-variable prefix.
    Comma,
    /// `'`
    Quote,
    /// `#`
    Hash,
    /// `;` acting as a separator (only ever emitted inside parens).
    Semicolon,
    Atom(String),
    Int(i32),
    Str(String),
    /// `!\c`: the ZSCII code of `c`.
    Char(u8),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    /// Byte offset into the preprocessed stream.
    pub offset: usize,
}

pub struct Lexer<'a> {
    text: &'a str,
    map: &'a SourceMap,
    pos: usize,
    paren_depth: u32,
    angle_depth: u32,
}

/// Characters that end an atom.
fn is_terminator(c: char) -> bool {
    c.is_whitespace()
        || matches!(c, '<' | '>' | '(' | ')' | '[' | ']' | '"' | ';' | '\'' | ',' | '%')
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str, map: &'a SourceMap) -> Self {
        Lexer { text, map, pos: 0, paren_depth: 0, angle_depth: 0 }
    }

    /// Tokenize the whole stream.
    pub fn tokenize(mut self) -> Result<Vec<SpannedToken>, FrontendError> {
        let mut out = Vec::new();
        while let Some(tok) = self.next_token()? {
            out.push(tok);
        }
        Ok(out)
    }

    fn bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes().get(self.pos + ahead).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek(0) {
            if (b as char).is_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn err_loc(&self, offset: usize) -> crate::error::Location {
        self.map.location(offset)
    }

    pub fn next_token(&mut self) -> Result<Option<SpannedToken>, FrontendError> {
        loop {
            self.skip_whitespace();
            let start = self.pos;
            let Some(b) = self.peek(0) else { return Ok(None) };
            let token = match b {
                b'<' => {
                    self.pos += 1;
                    self.angle_depth += 1;
                    Token::LAngle
                }
                b'>' => {
                    self.pos += 1;
                    self.angle_depth = self.angle_depth.saturating_sub(1);
                    Token::RAngle
                }
                b'(' => {
                    self.pos += 1;
                    self.paren_depth += 1;
                    Token::LParen
                }
                b')' => {
                    self.pos += 1;
                    self.paren_depth = self.paren_depth.saturating_sub(1);
                    Token::RParen
                }
                b'[' => {
                    self.pos += 1;
                    Token::LBracket
                }
                b']' => {
                    self.pos += 1;
                    Token::RBracket
                }
                b'\'' => {
                    self.pos += 1;
                    Token::Quote
                }
                b',' => {
                    self.pos += 1;
                    Token::Comma
                }
                b'#' => {
                    self.pos += 1;
                    Token::Hash
                }
                b'"' => self.lex_string()?,
                b';' => {
                    // The central subtlety: separator or comment?
                    let mut j = self.pos + 1;
                    while j < self.text.len()
                        && (self.bytes()[j] as char).is_whitespace()
                    {
                        j += 1;
                    }
                    let next = self.bytes().get(j).copied();
                    let comment_opener = matches!(next, Some(b'"') | Some(b'<') | Some(b'('));
                    if self.paren_depth > 0 && !comment_opener {
                        self.pos += 1;
                        Token::Semicolon
                    } else {
                        // Swallow one datum and carry on.
                        if next.is_none() {
                            self.pos = j;
                            return Ok(None);
                        }
                        self.pos = raw_datum_end(self.text, j).map_err(|(off, close)| {
                            FrontendError::Unbalanced { loc: self.err_loc(off), close }
                        })?;
                        continue;
                    }
                }
                b'!' => {
                    if self.peek(1) == Some(b'\\') {
                        let c = self.text[self.pos + 2..].chars().next().ok_or_else(|| {
                            FrontendError::MalformedToken {
                                loc: self.err_loc(start),
                                text: "!\\".into(),
                            }
                        })?;
                        if !c.is_ascii() {
                            return Err(FrontendError::MalformedToken {
                                loc: self.err_loc(start),
                                text: format!("!\\{c}"),
                            });
                        }
                        self.pos += 2 + c.len_utf8();
                        Token::Char(c as u8)
                    } else if self.peek(1) == Some(b'[') {
                        // `![ … ]` reads like an ordinary vector here.
                        self.pos += 2;
                        Token::LBracket
                    } else if self.peek(1) == Some(b']') {
                        self.pos += 2;
                        Token::RBracket
                    } else {
                        return Err(FrontendError::MalformedToken {
                            loc: self.err_loc(start),
                            text: "!".into(),
                        });
                    }
                }
                b'.' => {
                    self.pos += 1;
                    Token::Dot
                }
                b'%' => {
                    // All read-macros were resolved by the preprocessor.
                    return Err(FrontendError::MalformedToken {
                        loc: self.err_loc(start),
                        text: "%".into(),
                    });
                }
                _ => self.lex_atom_or_number()?,
            };
            return Ok(Some(SpannedToken { token, offset: start }));
        }
    }

    fn lex_string(&mut self) -> Result<Token, FrontendError> {
        let start = self.pos;
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            let Some(b) = self.peek(0) else {
                return Err(FrontendError::UnterminatedString { loc: self.err_loc(start) });
            };
            match b {
                b'"' => {
                    self.pos += 1;
                    return Ok(Token::Str(out));
                }
                b'\\' => {
                    let Some(e) = self.peek(1) else {
                        return Err(FrontendError::UnterminatedString {
                            loc: self.err_loc(start),
                        });
                    };
                    out.push(match e {
                        b'n' => '\n',
                        b't' => ' ',
                        other => other as char,
                    });
                    self.pos += 2;
                }
                b'|' => {
                    // The ZIL in-string newline.
                    out.push('\n');
                    self.pos += 1;
                }
                b'\n' => {
                    // A literal newline (plus indentation) collapses to
                    // one space, unless a `|` just produced a newline.
                    self.pos += 1;
                    while matches!(self.peek(0), Some(b' ') | Some(b'\t')) {
                        self.pos += 1;
                    }
                    if !out.ends_with('\n') {
                        out.push(' ');
                    }
                }
                _ => {
                    let c = self.text[self.pos..].chars().next().unwrap();
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    fn lex_atom_or_number(&mut self) -> Result<Token, FrontendError> {
        let start = self.pos;
        while let Some(b) = self.peek(0) {
            if is_terminator(b as char) {
                break;
            }
            self.pos += 1;
        }
        let text = &self.text[start..self.pos];
        debug_assert!(!text.is_empty());

        // `$hex`, then decimal, then atom.
        if let Some(hex) = text.strip_prefix('$') {
            if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
                let n = u32::from_str_radix(hex, 16).map_err(|_| {
                    FrontendError::MalformedToken {
                        loc: self.err_loc(start),
                        text: text.into(),
                    }
                })?;
                return Ok(Token::Int(n as i32));
            }
        }
        let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n) = text.parse::<i32>() {
                return Ok(Token::Int(n));
            }
            return Err(FrontendError::MalformedToken {
                loc: self.err_loc(start),
                text: text.into(),
            });
        }
        Ok(Token::Atom(text.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        let map = SourceMap::single_file("t.zil", src);
        Lexer::new(src, &map)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn basic_tokens() {
        assert_eq!(
            lex("<GLOBAL X 5>"),
            vec![
                Token::LAngle,
                Token::Atom("GLOBAL".into()),
                Token::Atom("X".into()),
                Token::Int(5),
                Token::RAngle,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(lex("-7 +3 $FF 12"), vec![
            Token::Int(-7),
            Token::Int(3),
            Token::Int(255),
            Token::Int(12)
        ]);
        // A sign alone, or digits with a suffix, is an atom.
        assert_eq!(lex("- 1ST?"), vec![Token::Atom("-".into()), Token::Atom("1ST?".into())]);
    }

    #[test]
    fn prefixes() {
        assert_eq!(lex(".X ,Y 'Z"), vec![
            Token::Dot,
            Token::Atom("X".into()),
            Token::Comma,
            Token::Atom("Y".into()),
            Token::Quote,
            Token::Atom("Z".into()),
        ]);
    }

    #[test]
    fn char_literal() {
        assert_eq!(lex(r"!\A"), vec![Token::Char(b'A')]);
        assert_eq!(lex(r"!\ "), vec![Token::Char(b' ')]);
    }

    #[test]
    fn semicolon_separator_inside_parens() {
        // Inside parens, not followed by a comment opener: separator.
        assert_eq!(
            lex("(FOO ; BAR)"),
            vec![
                Token::LParen,
                Token::Atom("FOO".into()),
                Token::Semicolon,
                Token::Atom("BAR".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn semicolon_comment_inside_parens() {
        // Followed by a string: comment, the string is discarded.
        assert_eq!(
            lex("(FOO ;\"note\" BAR)"),
            vec![
                Token::LParen,
                Token::Atom("FOO".into()),
                Token::Atom("BAR".into()),
                Token::RParen,
            ]
        );
        // Followed by a form: the whole form is discarded.
        assert_eq!(
            lex("(FOO ;<OLD STUFF <NESTED>> BAR)"),
            vec![
                Token::LParen,
                Token::Atom("FOO".into()),
                Token::Atom("BAR".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn semicolon_comment_at_top_level() {
        // Outside parens a `;` always comments, even before an atom.
        assert_eq!(lex("; gone <KEPT>"), vec![
            Token::LAngle,
            Token::Atom("KEPT".into()),
            Token::RAngle
        ]);
    }

    #[test]
    fn semicolon_inside_angles_only_is_comment() {
        // Angle depth alone does not make a separator.
        assert_eq!(
            lex("<TELL ;CUT \"hi\">"),
            vec![
                Token::LAngle,
                Token::Atom("TELL".into()),
                Token::Str("hi".into()),
                Token::RAngle
            ]
        );
    }

    #[test]
    fn string_escapes_and_newlines() {
        assert_eq!(lex(r#""a\"b""#), vec![Token::Str("a\"b".into())]);
        assert_eq!(lex("\"a|b\""), vec![Token::Str("a\nb".into())]);
        // Literal newline plus indentation collapses to one space.
        assert_eq!(lex("\"two\n     lines\""), vec![Token::Str("two lines".into())]);
        // ... but not right after a `|`.
        assert_eq!(lex("\"two|\n     lines\""), vec![Token::Str("two\nlines".into())]);
    }

    #[test]
    fn unterminated_string() {
        let map = SourceMap::single_file("t.zil", "\"oops");
        let err = Lexer::new("\"oops", &map).tokenize().unwrap_err();
        assert!(matches!(err, FrontendError::UnterminatedString { .. }));
    }
}
