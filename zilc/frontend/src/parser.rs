//! The reader: tokens to [`Value`] trees.
//!
//! The parser is deliberately ignorant of ZIL semantics. Top-level
//! operators it does not recognize are perfectly fine: they stay
//! generic forms until macro expansion, and the declaration recognizer
//! deals with whatever is left.

use crate::error::FrontendError;
use crate::intern::{Atom, Interner};
use crate::lexer::{Lexer, SpannedToken, Token};
use crate::preprocess::SourceMap;
use crate::value::Value;

/// A parsed top-level datum with its stream offset (for locations).
#[derive(Clone, Debug)]
pub struct TopLevel {
    pub value: Value,
    pub offset: usize,
}

/// Spelling of the separator marker emitted for `;` separator tokens.
pub const SEPARATOR_NAME: &str = ";";

pub struct Parser<'a> {
    tokens: Vec<SpannedToken>,
    pos: usize,
    map: &'a SourceMap,
    interner: &'a mut Interner,
}

impl<'a> Parser<'a> {
    pub fn new(
        text: &'a str,
        map: &'a SourceMap,
        interner: &'a mut Interner,
    ) -> Result<Self, FrontendError> {
        let tokens = Lexer::new(text, map).tokenize()?;
        Ok(Parser { tokens, pos: 0, map, interner })
    }

    /// Parse every top-level datum in the stream.
    pub fn parse_program(mut self) -> Result<Vec<TopLevel>, FrontendError> {
        let mut out = Vec::new();
        while self.pos < self.tokens.len() {
            let offset = self.tokens[self.pos].offset;
            let value = self.parse_datum()?;
            out.push(TopLevel { value, offset });
        }
        Ok(out)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn next(&mut self) -> Option<SpannedToken> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn here(&self) -> crate::error::Location {
        let offset = self
            .tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|t| t.offset)
            .unwrap_or(0);
        self.map.location(offset)
    }

    fn unexpected(&self, found: &str, expected: &str) -> FrontendError {
        FrontendError::Unexpected {
            loc: self.here(),
            found: found.into(),
            expected: Some(expected.into()),
        }
    }

    fn parse_datum(&mut self) -> Result<Value, FrontendError> {
        let Some(tok) = self.next() else {
            return Err(self.unexpected("end of input", "a datum"));
        };
        match tok.token {
            Token::LAngle => self.parse_seq(Token::RAngle).map(Value::Form),
            Token::LParen => self.parse_seq(Token::RParen).map(Value::List),
            Token::LBracket => self.parse_seq(Token::RBracket).map(Value::Vector),
            Token::RAngle => Err(self.unexpected(">", "a datum")),
            Token::RParen => Err(self.unexpected(")", "a datum")),
            Token::RBracket => Err(self.unexpected("]", "a datum")),
            Token::Atom(name) => Ok(Value::Atom(self.interner.intern(&name))),
            Token::Int(n) => Ok(Value::Int(n)),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Char(c) => Ok(Value::Char(c)),
            Token::Quote => Ok(Value::Quote(Box::new(self.parse_datum()?))),
            Token::Dot => self.prefix_form("LVAL"),
            Token::Comma => self.prefix_form("GVAL"),
            Token::Semicolon => Ok(Value::Atom(self.interner.intern(SEPARATOR_NAME))),
            Token::Hash => self.parse_hash(),
        }
    }

    fn parse_seq(&mut self, close: Token) -> Result<Vec<Value>, FrontendError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    let c = match close {
                        Token::RAngle => '>',
                        Token::RParen => ')',
                        _ => ']',
                    };
                    return Err(FrontendError::Unbalanced { loc: self.here(), close: c });
                }
                Some(t) if *t == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => items.push(self.parse_datum()?),
            }
        }
    }

    fn prefix_form(&mut self, op: &str) -> Result<Value, FrontendError> {
        let op = Value::Atom(self.interner.intern(op));
        let arg = self.parse_datum()?;
        Ok(Value::Form(vec![op, arg]))
    }

    /// `#type datum`: `#SPLICE (…)`, `#BYTE n`, `#2 1010` (binary).
    fn parse_hash(&mut self) -> Result<Value, FrontendError> {
        let Some(tok) = self.next() else {
            return Err(self.unexpected("end of input", "a hash type"));
        };
        match tok.token {
            Token::Atom(name) if name.eq_ignore_ascii_case("SPLICE") => {
                match self.parse_datum()? {
                    Value::List(items) => Ok(Value::Splice(items)),
                    other => {
                        let shown = other.display(self.interner);
                        Err(self.unexpected(&shown, "a (…) list after #SPLICE"))
                    }
                }
            }
            Token::Int(2) => {
                // Binary literal: the digits were lexed as a decimal
                // number or an atom; reinterpret them base 2.
                let digits = match self.next().map(|t| t.token) {
                    Some(Token::Int(n)) => n.to_string(),
                    Some(Token::Atom(a)) => a,
                    _ => return Err(self.unexpected("end of input", "binary digits")),
                };
                i32::from_str_radix(&digits, 2)
                    .map(Value::Int)
                    .map_err(|_| self.unexpected(&digits, "binary digits"))
            }
            Token::Atom(name) => {
                let op = Value::Atom(self.interner.intern(&name));
                let arg = self.parse_datum()?;
                Ok(Value::Form(vec![op, arg]))
            }
            other => Err(self.unexpected(&format!("{other:?}"), "a hash type")),
        }
    }
}

/// Parse a standalone fragment with its own interner. Used by the
/// preprocessor to read directive forms and clause predicates.
pub fn parse_fragment(text: &str) -> Option<(Value, Interner)> {
    let map = SourceMap::single_file("<fragment>", text);
    let mut interner = Interner::new();
    let mut parser = Parser::new(text, &map, &mut interner).ok()?;
    let v = parser.parse_datum().ok()?;
    Some((v, interner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> (Vec<TopLevel>, Interner) {
        let map = SourceMap::single_file("t.zil", src);
        let mut interner = Interner::new();
        let tops = Parser::new(src, &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        (tops, interner)
    }

    #[test]
    fn nested_forms() {
        let (tops, mut i) = parse("<ROUTINE GO () <QUIT>>");
        assert_eq!(tops.len(), 1);
        let routine = i.intern("ROUTINE");
        let args = tops[0].value.form_args(routine).unwrap();
        assert_eq!(args.len(), 3);
        assert!(matches!(&args[1], Value::List(l) if l.is_empty()));
        assert!(matches!(&args[2], Value::Form(_)));
    }

    #[test]
    fn variable_prefixes_become_forms() {
        let (tops, mut i) = parse("<SET X .Y> <SETG A ,B>");
        let lval = i.intern("LVAL");
        let set = i.intern("SET");
        let args = tops[0].value.form_args(set).unwrap();
        assert!(args[1].form_args(lval).is_some());
    }

    #[test]
    fn quoting() {
        let (tops, _) = parse("'<FOO>");
        assert!(matches!(&tops[0].value, Value::Quote(inner) if matches!(**inner, Value::Form(_))));
    }

    #[test]
    fn empty_form_is_false() {
        let (tops, _) = parse("<>");
        assert!(tops[0].value.is_false());
    }

    #[test]
    fn hash_forms() {
        let (tops, _) = parse("#2 1010");
        assert_eq!(tops[0].value, Value::Int(10));
        let (tops, _) = parse("#SPLICE (1 2)");
        assert!(matches!(&tops[0].value, Value::Splice(items) if items.len() == 2));
        let (tops, mut i) = parse("#BYTE 255");
        let byte = i.intern("BYTE");
        assert_eq!(tops[0].value.form_args(byte), Some(&[Value::Int(255)][..]));
    }

    #[test]
    fn separator_markers_survive_in_lists() {
        let (tops, mut i) = parse("<SYNONYM (A ; B)>");
        let syn = i.intern("SYNONYM");
        let sep = i.intern(SEPARATOR_NAME);
        let args = tops[0].value.form_args(syn).unwrap();
        let list = args[0].as_list().unwrap();
        assert_eq!(list[1], Value::Atom(sep));
    }

    #[test]
    fn missing_close_is_reported() {
        let map = SourceMap::single_file("t.zil", "<FOO (A B>");
        let mut interner = Interner::new();
        let err = Parser::new("<FOO (A B>", &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap_err();
        // `>` inside the open paren is not a list element.
        assert!(matches!(err, FrontendError::Unexpected { .. } | FrontendError::Unbalanced { .. }));
    }
}
