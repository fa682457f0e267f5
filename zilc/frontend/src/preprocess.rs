//! The source preprocessor.
//!
//! Runs on raw text, before lexing: file inclusion, compilation-flag
//! extraction, `%<COND>` / `%<VERSION?>` / `<IFFLAG>` branch selection,
//! and declaration stripping. Branch selection must happen textually
//! because unselected branches are allowed to contain forms that are
//! only well-formed under a different dialect or version.
//!
//! The output is a single flat stream plus a [`SourceMap`] that
//! translates offsets in that stream back to file/line/column in the
//! original inputs.

use log::{debug, trace};
use rustc_hash::FxHashMap;

use crate::error::{FrontendError, Location};
use crate::parser::parse_fragment;
use crate::value::Value;

/// Resolves `INSERT-FILE` names to file contents. Implemented by the
/// driver; the front end itself never touches the filesystem.
pub trait SourceLoader {
    fn load(&mut self, name: &str) -> Result<String, String>;
}

/// A loader for sources that must not include anything.
pub struct NoIncludes;

impl SourceLoader for NoIncludes {
    fn load(&mut self, name: &str) -> Result<String, String> {
        Err(format!("no include path configured for \"{name}\""))
    }
}

#[derive(Debug)]
struct FileInfo {
    name: String,
    /// Byte offsets of line starts in the normalized file text.
    line_starts: Vec<usize>,
}

#[derive(Debug)]
struct Segment {
    out_start: usize,
    file: u32,
    src_start: usize,
}

/// Maps offsets in the preprocessed stream back to original locations.
#[derive(Debug)]
pub struct SourceMap {
    files: Vec<FileInfo>,
    segments: Vec<Segment>,
}

impl SourceMap {
    fn new() -> Self {
        SourceMap { files: Vec::new(), segments: Vec::new() }
    }

    /// A map for text that went through no preprocessing. For tests and
    /// fragment parsing.
    pub fn single_file(name: &str, text: &str) -> Self {
        let mut map = SourceMap::new();
        let file = map.add_file(name, text);
        map.segments.push(Segment { out_start: 0, file, src_start: 0 });
        map
    }

    fn add_file(&mut self, name: &str, text: &str) -> u32 {
        let mut line_starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        self.files.push(FileInfo { name: name.to_owned(), line_starts });
        (self.files.len() - 1) as u32
    }

    /// Translate an offset in the preprocessed stream.
    pub fn location(&self, out_offset: usize) -> Location {
        let seg = match self.segments.binary_search_by(|s| s.out_start.cmp(&out_offset)) {
            Ok(i) => &self.segments[i],
            Err(0) => return Location::new("<input>", 1, 1),
            Err(i) => &self.segments[i - 1],
        };
        let file = &self.files[seg.file as usize];
        let src = seg.src_start + (out_offset - seg.out_start);
        let line = match file.line_starts.binary_search(&src) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let column = src - file.line_starts[line] + 1;
        Location::new(file.name.clone(), (line + 1) as u32, column as u32)
    }
}

/// A compile-time environment value, as far as the preprocessor can see.
#[derive(Clone, Debug, PartialEq)]
enum PVal {
    Int(i32),
    Atom(String),
    True,
    False,
    /// Set to something the preprocessor does not evaluate.
    Opaque,
}

/// Result of the preprocessing pass.
#[derive(Debug)]
pub struct Preprocessed {
    pub text: String,
    pub map: SourceMap,
    /// `COMPILATION-FLAG` results, by canonical name.
    pub flags: FxHashMap<String, bool>,
    /// Target version as declared by `<VERSION …>`, if any.
    pub version: Option<u8>,
}

/// Normalize line endings and control characters. Form feeds and other
/// C0 controls become spaces so column counting stays sane.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            '\n' | '\t' => out.push(c),
            c if (c as u32) < 0x20 => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

pub struct Preprocessor<'a> {
    loader: &'a mut dyn SourceLoader,
    /// Version supplied by the driver (command line), if any. A
    /// `<VERSION …>` form in the source takes precedence.
    version: Option<u8>,
    flags: FxHashMap<String, bool>,
    env: FxHashMap<String, PVal>,
    out: String,
    map: SourceMap,
    include_stack: Vec<String>,
}

/// Forms the preprocessor erases without replacement.
const STRIPPED_FORMS: &[&str] = &[
    "GDECL",
    "PACKAGE",
    "ENDPACKAGE",
    "ENTRY",
    "USE",
    "DEFINITIONS",
    "END-DEFINITIONS",
];

impl<'a> Preprocessor<'a> {
    pub fn new(loader: &'a mut dyn SourceLoader, version: Option<u8>) -> Self {
        Preprocessor {
            loader,
            version,
            flags: FxHashMap::default(),
            env: FxHashMap::default(),
            out: String::new(),
            map: SourceMap::new(),
            include_stack: Vec::new(),
        }
    }

    pub fn run(mut self, main_name: &str, text: &str) -> Result<Preprocessed, FrontendError> {
        self.include_stack.push(main_name.to_owned());
        self.process_file(main_name, text)?;
        debug!(
            "preprocessed {} file(s) into {} bytes",
            self.map.files.len(),
            self.out.len()
        );
        Ok(Preprocessed {
            text: self.out,
            map: self.map,
            flags: self.flags,
            version: self.version,
        })
    }

    fn process_file(&mut self, name: &str, text: &str) -> Result<(), FrontendError> {
        let text = normalize(text);
        let file = self.map.add_file(name, &text);
        let mut cx = FileCx { file, text: &text };
        self.process_range(&mut cx, 0, text.len())
    }

    fn loc(&self, cx: &FileCx, offset: usize) -> Location {
        let file = &self.map.files[cx.file as usize];
        let line = match file.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Location::new(
            file.name.clone(),
            (line + 1) as u32,
            (offset - file.line_starts[line] + 1) as u32,
        )
    }

    /// Copy a run of source text through to the output, recording the
    /// segment for location mapping.
    fn emit(&mut self, cx: &FileCx, start: usize, end: usize) {
        if start >= end {
            return;
        }
        self.map.segments.push(Segment {
            out_start: self.out.len(),
            file: cx.file,
            src_start: start,
        });
        self.out.push_str(&cx.text[start..end]);
    }

    fn emit_sep(&mut self) {
        if !self.out.ends_with(char::is_whitespace) {
            // Synthesized whitespace belongs to no file; attach it to the
            // previous segment by just growing the output.
            self.out.push(' ');
        }
    }

    /// Process the half-open range `[i, end)` of one file, copying text
    /// and handling directives.
    fn process_range(&mut self, cx: &mut FileCx, mut i: usize, end: usize) -> Result<(), FrontendError> {
        let bytes = cx.text.as_bytes();
        let mut run_start = i;
        while i < end {
            match bytes[i] {
                b'"' => {
                    i = self.scan_string(cx, i)?;
                }
                b'%' => {
                    // Read-time evaluation: %<…> splices its result,
                    // %%<…> evaluates for effect only. A `%` not
                    // introducing a form is ordinary atom text.
                    let effect_only = bytes.get(i + 1) == Some(&b'%');
                    let form_start = if effect_only { i + 2 } else { i + 1 };
                    if bytes.get(form_start) != Some(&b'<') {
                        i += 1;
                        continue;
                    }
                    self.emit(cx, run_start, i);
                    let form_end = self.raw_datum_end(cx, form_start)?;
                    self.eval_read_form(cx, form_start, form_end, effect_only)?;
                    i = form_end;
                    run_start = i;
                }
                b'<' => {
                    let op = peek_operator(cx.text, i + 1);
                    match op.as_deref() {
                        Some("INSERT-FILE") | Some("IFILE") => {
                            self.emit(cx, run_start, i);
                            let form_end = self.raw_datum_end(cx, i)?;
                            self.insert_file(cx, i, form_end)?;
                            i = form_end;
                            run_start = i;
                        }
                        Some("COMPILATION-FLAG") | Some("COMPILATION-FLAG-DEFAULT") => {
                            self.emit(cx, run_start, i);
                            let form_end = self.raw_datum_end(cx, i)?;
                            self.compilation_flag(cx, i, form_end)?;
                            i = form_end;
                            run_start = i;
                        }
                        Some("IFFLAG") => {
                            self.emit(cx, run_start, i);
                            let form_end = self.raw_datum_end(cx, i)?;
                            self.ifflag(cx, i, form_end)?;
                            i = form_end;
                            run_start = i;
                        }
                        Some("VERSION") => {
                            // Record it for later %<VERSION?> tests, but
                            // keep the form: the recognizer consumes it.
                            if let Some((Value::Form(items), names)) = self.parse_small_form(cx, i)
                            {
                                match items.get(1) {
                                    Some(Value::Int(n)) if (3..=8).contains(n) => {
                                        self.version = Some(*n as u8)
                                    }
                                    Some(Value::Atom(a)) => match names.name(*a) {
                                        "ZIP" => self.version = Some(3),
                                        "EZIP" => self.version = Some(4),
                                        "XZIP" => self.version = Some(5),
                                        "YZIP" => self.version = Some(6),
                                        _ => {}
                                    },
                                    _ => {}
                                }
                            }
                            let form_end = self.raw_datum_end(cx, i)?;
                            self.emit(cx, run_start, form_end);
                            i = form_end;
                            run_start = i;
                        }
                        Some("SETG") => {
                            if let Some((v, names)) = self.parse_small_form(cx, i) {
                                self.record_setg(&v, &names);
                            }
                            let form_end = self.raw_datum_end(cx, i)?;
                            self.emit(cx, run_start, form_end);
                            i = form_end;
                            run_start = i;
                        }
                        Some(op) if STRIPPED_FORMS.contains(&op) => {
                            self.emit(cx, run_start, i);
                            i = self.raw_datum_end(cx, i)?;
                            self.emit_sep();
                            run_start = i;
                        }
                        _ => i += 1,
                    }
                }
                b'#' => {
                    // `#DECL (…)` declarations are stripped.
                    if peek_operator(cx.text, i + 1).as_deref() == Some("DECL") {
                        self.emit(cx, run_start, i);
                        let t = atom_end(cx.text, skip_ws(cx.text, i + 1));
                        let v = skip_ws(cx.text, t);
                        i = if v < end { self.raw_datum_end(cx, v)? } else { v };
                        self.emit_sep();
                        run_start = i;
                    } else {
                        i += 1;
                    }
                }
                b';' => {
                    // A top-level comment datum is copied raw so that a
                    // commented-out directive stays commented out.
                    let j = skip_ws(cx.text, i + 1);
                    if j < end {
                        i = self.raw_datum_end(cx, j)?;
                    } else {
                        i = j;
                    }
                }
                _ => i += 1,
            }
        }
        self.emit(cx, run_start, end.min(cx.text.len()));
        Ok(())
    }

    /// Copy a string literal without interpretation, returning the
    /// offset just past the closing quote.
    fn scan_string(&self, cx: &FileCx, start: usize) -> Result<usize, FrontendError> {
        match raw_string_end(cx.text, start) {
            Some(end) => Ok(end),
            None => Err(FrontendError::UnterminatedString { loc: self.loc(cx, start) }),
        }
    }

    fn raw_datum_end(&self, cx: &FileCx, start: usize) -> Result<usize, FrontendError> {
        raw_datum_end(cx.text, start).map_err(|(off, close)| FrontendError::Unbalanced {
            loc: self.loc(cx, off),
            close,
        })
    }

    /// Parse a small, lexically self-contained form (for directives).
    /// Returns the parsed value and an interner for its atom names.
    fn parse_small_form(&self, cx: &FileCx, start: usize) -> Option<(Value, crate::intern::Interner)> {
        let end = raw_datum_end(cx.text, start).ok()?;
        parse_fragment(&cx.text[start..end])
    }

    fn record_setg(&mut self, form: &Value, names: &crate::intern::Interner) {
        let Value::Form(items) = form else { return };
        if items.len() != 3 {
            return;
        }
        let Some(name) = items[1].as_atom().map(|a| names.name(a).to_owned()) else {
            return;
        };
        let val = match &items[2] {
            Value::Int(n) => PVal::Int(*n),
            Value::Atom(a) if names.name(*a) == "T" => PVal::True,
            Value::Atom(a) => PVal::Atom(names.name(*a).to_owned()),
            v if v.is_false() => PVal::False,
            _ => PVal::Opaque,
        };
        trace!("read-time SETG {name} = {val:?}");
        self.env.insert(name, val);
    }

    fn insert_file(&mut self, cx: &FileCx, start: usize, end: usize) -> Result<(), FrontendError> {
        let loc = self.loc(cx, start);
        let (form, names) = self.parse_small_form(cx, start).ok_or_else(|| FrontendError::Other {
            loc: loc.clone(),
            message: "malformed INSERT-FILE".into(),
        })?;
        let _ = end;
        let Value::Form(items) = &form else { unreachable!() };
        let name = match items.get(1) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Atom(a)) => names.name(*a).to_owned(),
            _ => {
                return Err(FrontendError::Other {
                    loc,
                    message: "INSERT-FILE needs a file name".into(),
                })
            }
        };
        if self.include_stack.iter().any(|f| f.eq_ignore_ascii_case(&name)) {
            let mut cycle = self.include_stack.join(" -> ");
            cycle.push_str(" -> ");
            cycle.push_str(&name);
            return Err(FrontendError::IncludeCycle { loc, cycle });
        }
        let text = self
            .loader
            .load(&name)
            .map_err(|reason| FrontendError::UnknownInclude { loc, name: name.clone(), reason })?;
        debug!("inserting file \"{name}\" ({} bytes)", text.len());
        self.include_stack.push(name.clone());
        self.emit_sep();
        self.process_file(&name, &text)?;
        self.emit_sep();
        self.include_stack.pop();
        Ok(())
    }

    fn compilation_flag(&mut self, cx: &FileCx, start: usize, _end: usize) -> Result<(), FrontendError> {
        let loc = self.loc(cx, start);
        let default_only = peek_operator(cx.text, start + 1).as_deref()
            == Some("COMPILATION-FLAG-DEFAULT");
        let (form, names) = self.parse_small_form(cx, start).ok_or_else(|| FrontendError::Other {
            loc: loc.clone(),
            message: "malformed COMPILATION-FLAG".into(),
        })?;
        let Value::Form(items) = &form else { unreachable!() };
        let name = items
            .get(1)
            .and_then(Value::as_atom)
            .map(|a| names.name(a).to_owned())
            .ok_or_else(|| FrontendError::Other {
                loc: loc.clone(),
                message: "COMPILATION-FLAG needs a name".into(),
            })?;
        let value = match items.get(2) {
            None => true,
            Some(Value::Atom(a)) if names.name(*a) == "T" => true,
            Some(v) if v.is_false() => false,
            Some(_) => return Err(FrontendError::BadFlagValue { loc, name }),
        };
        if default_only && self.flags.contains_key(&name) {
            return Ok(());
        }
        debug!("compilation flag {name} = {value}");
        self.flags.insert(name, value);
        Ok(())
    }

    /// `<IFFLAG (NAME …) (ELSE …)>`: splice the first matching clause.
    fn ifflag(&mut self, cx: &mut FileCx, start: usize, end: usize) -> Result<(), FrontendError> {
        // Position past the IFFLAG operator.
        let mut i = skip_ws(cx.text, start + 1);
        i = atom_end(cx.text, i);
        self.select_clause(cx, i, end - 1, |this, head, names| {
            Ok(match head.as_atom().map(|a| names.name(a)) {
                Some("ELSE") | Some("T") => true,
                Some(flag) => this.flags.get(flag).copied().unwrap_or(false),
                None => {
                    // (NAME value) pair.
                    if let Value::List(pair) | Value::Form(pair) = head {
                        if let [Value::Atom(a), v] = pair.as_slice() {
                            let want = v.is_truthy();
                            return Ok(this.flags.get(names.name(*a)).copied().unwrap_or(false)
                                == want);
                        }
                    }
                    false
                }
            })
        })
    }

    /// Evaluate `%<…>` / `%%<…>`.
    fn eval_read_form(
        &mut self,
        cx: &mut FileCx,
        start: usize,
        end: usize,
        effect_only: bool,
    ) -> Result<(), FrontendError> {
        let loc = self.loc(cx, start);
        let op = peek_operator(cx.text, start + 1);
        match op.as_deref() {
            Some("VERSION?") => {
                let mut i = skip_ws(cx.text, start + 1);
                i = atom_end(cx.text, i);
                let version = self.version.unwrap_or(3);
                self.select_clause(cx, i, end - 1, |_, head, names| {
                    Ok(match head {
                        Value::Int(n) => *n == i32::from(version),
                        Value::Atom(a) => match names.name(*a) {
                            "ZIP" => version == 3,
                            "EZIP" => version == 4,
                            "XZIP" => version == 5,
                            "YZIP" => version == 6,
                            "ELSE" | "T" => true,
                            _ => false,
                        },
                        _ => false,
                    })
                })
            }
            Some("COND") => {
                let mut i = skip_ws(cx.text, start + 1);
                i = atom_end(cx.text, i);
                self.select_clause(cx, i, end - 1, |this, head, names| {
                    Ok(this.eval_pred(head, names))
                })
            }
            Some("SETG") => {
                if let Some((v, names)) = self.parse_small_form(cx, start) {
                    self.record_setg(&v, &names);
                }
                Ok(())
            }
            _ if effect_only => Ok(()),
            _ => Err(FrontendError::Other {
                loc,
                message: format!(
                    "unsupported read-time form %<{}>",
                    op.unwrap_or_default()
                ),
            }),
        }
    }

    /// Shared clause walker for IFFLAG / %<VERSION?> / %<COND>: scan
    /// `(head body…)` clauses in `[i, end)`, splice the body of the
    /// first clause whose head satisfies `test`.
    fn select_clause(
        &mut self,
        cx: &mut FileCx,
        mut i: usize,
        end: usize,
        mut test: impl FnMut(&mut Self, &Value, &crate::intern::Interner) -> Result<bool, FrontendError>,
    ) -> Result<(), FrontendError> {
        loop {
            i = skip_ws(cx.text, i);
            if i >= end {
                return Ok(()); // no clause matched; splice nothing
            }
            let clause_end = self.raw_datum_end(cx, i)?;
            if cx.text.as_bytes()[i] != b'(' {
                return Err(FrontendError::Unexpected {
                    loc: self.loc(cx, i),
                    found: cx.text[i..clause_end.min(i + 8)].into(),
                    expected: Some("a (condition …) clause".into()),
                });
            }
            let head_start = skip_ws(cx.text, i + 1);
            let head_end = self.raw_datum_end(cx, head_start)?;
            let (head, names) =
                parse_fragment(&cx.text[head_start..head_end]).ok_or_else(|| FrontendError::Other {
                    loc: self.loc(cx, head_start),
                    message: "unreadable condition in conditional clause".into(),
                })?;
            if test(self, &head, &names)? {
                trace!("conditional selects clause at offset {i}");
                return self.process_range(cx, head_end, clause_end - 1);
            }
            i = clause_end;
        }
    }

    /// Predicate evaluation for `%<COND …>` against the read-time
    /// environment.
    fn eval_pred(&self, pred: &Value, names: &crate::intern::Interner) -> bool {
        match pred {
            Value::Int(_) | Value::String(_) => true,
            Value::Atom(a) => match names.name(*a) {
                "T" | "ELSE" => true,
                name => !matches!(self.env.get(name), None | Some(PVal::False)),
            },
            Value::Form(items) if items.is_empty() => false,
            Value::Form(items) => {
                let Some(op) = items[0].as_atom().map(|a| names.name(a)) else {
                    return false;
                };
                let args = &items[1..];
                match op {
                    "GASSIGNED?" => args
                        .first()
                        .and_then(Value::as_atom)
                        .is_some_and(|a| self.env.contains_key(names.name(a))),
                    "COMPILATION-FLAG-VALUE" => args
                        .first()
                        .and_then(Value::as_atom)
                        .is_some_and(|a| self.flags.get(names.name(a)).copied().unwrap_or(false)),
                    "NOT" => args.first().is_some_and(|v| !self.eval_pred(v, names)),
                    "AND" => args.iter().all(|v| self.eval_pred(v, names)),
                    "OR" => args.iter().any(|v| self.eval_pred(v, names)),
                    "==?" | "=?" | "N==?" | "N=?" => {
                        let eq = match (args.first(), args.get(1)) {
                            (Some(a), Some(b)) => {
                                self.resolve(a, names) == self.resolve(b, names)
                            }
                            _ => false,
                        };
                        if op.starts_with('N') {
                            !eq
                        } else {
                            eq
                        }
                    }
                    "GVAL" => args
                        .first()
                        .and_then(Value::as_atom)
                        .is_some_and(|a| {
                            !matches!(self.env.get(names.name(a)), None | Some(PVal::False))
                        }),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Resolve a predicate operand to a comparable read-time value.
    fn resolve(&self, v: &Value, names: &crate::intern::Interner) -> PVal {
        match v {
            Value::Int(n) => PVal::Int(*n),
            Value::Atom(a) => PVal::Atom(names.name(*a).to_owned()),
            Value::Form(items) => {
                if let [op, Value::Atom(a)] = items.as_slice() {
                    if op.as_atom().map(|o| names.name(o)) == Some("GVAL") {
                        return self.env.get(names.name(*a)).cloned().unwrap_or(PVal::False);
                    }
                }
                PVal::Opaque
            }
            v if v.is_false() => PVal::False,
            _ => PVal::Opaque,
        }
    }
}

struct FileCx<'t> {
    file: u32,
    text: &'t str,
}

/// Skip whitespace, returning the next offset.
fn skip_ws(text: &str, mut i: usize) -> usize {
    let bytes = text.as_bytes();
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    i
}

/// End of an atom-ish run starting at `i`.
fn atom_end(text: &str, mut i: usize) -> usize {
    let bytes = text.as_bytes();
    while i < bytes.len() && !is_atom_terminator(bytes[i]) {
        i += 1;
    }
    i
}

fn is_atom_terminator(b: u8) -> bool {
    (b as char).is_whitespace() || matches!(b, b'<' | b'>' | b'(' | b')' | b'[' | b']' | b'"' | b';' | b'\'' | b',')
}

/// Uppercased operator atom directly after `i` (which should point past
/// a `<`), if there is one.
fn peek_operator(text: &str, i: usize) -> Option<String> {
    let start = skip_ws(text, i);
    let end = atom_end(text, start);
    if end > start {
        Some(text[start..end].to_ascii_uppercase())
    } else {
        None
    }
}

/// Find the end of the string literal starting at `start` (a `"`).
fn raw_string_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Find the end of one raw datum starting at `start` (non-whitespace),
/// honouring strings and nested brackets but not interpreting anything.
/// On unbalanced input returns the offset of the failure and the
/// expected closing bracket.
pub(crate) fn raw_datum_end(text: &str, start: usize) -> Result<usize, (usize, char)> {
    let bytes = text.as_bytes();
    debug_assert!(start < bytes.len());
    match bytes[start] {
        b'"' => raw_string_end(text, start).ok_or((start, '"')),
        b'<' | b'(' | b'[' => {
            let mut stack = vec![close_of(bytes[start])];
            let mut i = start + 1;
            while let Some(&expect) = stack.last() {
                if i >= bytes.len() {
                    return Err((start, expect));
                }
                match bytes[i] {
                    b'"' => i = raw_string_end(text, i).ok_or((i, '"'))?,
                    b'<' | b'(' | b'[' => {
                        stack.push(close_of(bytes[i]));
                        i += 1;
                    }
                    b'>' | b')' | b']' => {
                        if bytes[i] as char != expect {
                            return Err((i, expect));
                        }
                        stack.pop();
                        i += 1;
                    }
                    _ => i += 1,
                }
            }
            Ok(i)
        }
        b'\'' | b';' | b'.' | b',' | b'%' => {
            let i = skip_ws(text, start + 1);
            if i >= bytes.len() {
                return Ok(start + 1);
            }
            raw_datum_end(text, i)
        }
        b'!' => {
            if bytes.get(start + 1) == Some(&b'\\') {
                Ok((start + 3).min(bytes.len()))
            } else {
                let i = skip_ws(text, start + 1);
                if i >= bytes.len() {
                    return Ok(start + 1);
                }
                raw_datum_end(text, i)
            }
        }
        b'#' => {
            // Hash type atom, then one datum.
            let t = atom_end(text, skip_ws(text, start + 1));
            let v = skip_ws(text, t);
            if v >= bytes.len() {
                return Ok(t);
            }
            raw_datum_end(text, v)
        }
        _ => Ok(atom_end(text, start)),
    }
}

fn close_of(open: u8) -> char {
    match open {
        b'<' => '>',
        b'(' => ')',
        _ => ']',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> Preprocessed {
        let mut loader = NoIncludes;
        Preprocessor::new(&mut loader, None).run("test.zil", src).unwrap()
    }

    #[test]
    fn passthrough() {
        let p = run("<ROUTINE GO () <QUIT>>");
        assert_eq!(p.text, "<ROUTINE GO () <QUIT>>");
    }

    #[test]
    fn strips_declarations() {
        let p = run("<GDECL (X) FIX> <ROUTINE GO () <QUIT>> <ENDPACKAGE>");
        assert!(!p.text.contains("GDECL"));
        assert!(p.text.contains("<ROUTINE GO () <QUIT>>"));
        assert!(!p.text.contains("ENDPACKAGE"));
    }

    #[test]
    fn compilation_flags() {
        let p = run("<COMPILATION-FLAG DEBUG T> <COMPILATION-FLAG SOUND <>>");
        assert_eq!(p.flags.get("DEBUG"), Some(&true));
        assert_eq!(p.flags.get("SOUND"), Some(&false));
        assert!(!p.text.contains("COMPILATION-FLAG"));
    }

    #[test]
    fn flag_default_does_not_override() {
        let p = run("<COMPILATION-FLAG DEBUG T> <COMPILATION-FLAG-DEFAULT DEBUG <>>");
        assert_eq!(p.flags.get("DEBUG"), Some(&true));
    }

    #[test]
    fn ifflag_selects_branch() {
        let p = run("<COMPILATION-FLAG DEBUG T> <IFFLAG (DEBUG <TELL \"dbg\">) (ELSE <TELL \"rel\">)>");
        assert!(p.text.contains("dbg"));
        assert!(!p.text.contains("rel"));
    }

    #[test]
    fn ifflag_else_branch() {
        let p = run("<IFFLAG (NOSUCH <A>) (ELSE <B>)>");
        assert!(!p.text.contains("<A>"));
        assert!(p.text.contains("<B>"));
    }

    #[test]
    fn version_conditional() {
        let p = run("<VERSION 5> %<VERSION? (ZIP <OLD>) (XZIP <NEW>) (ELSE <OTHER>)>");
        assert_eq!(p.version, Some(5));
        assert!(p.text.contains("<NEW>"));
        assert!(!p.text.contains("<OLD>"));
    }

    #[test]
    fn unselected_branch_may_be_illformed() {
        // The ZIP branch would never lex: that must not matter.
        let p = run("<VERSION 5> %<VERSION? (ZIP %@#!bogus) (ELSE <OK>)>");
        assert!(p.text.contains("<OK>"));
    }

    #[test]
    fn read_time_cond() {
        let p = run("<SETG DEBUG T> %<COND (<GASSIGNED? DEBUG> <YES>) (T <NO>)>");
        assert!(p.text.contains("<YES>"));
        assert!(!p.text.contains("<NO>"));
    }

    #[test]
    fn include_cycles_rejected() {
        struct Cyclic;
        impl SourceLoader for Cyclic {
            fn load(&mut self, _name: &str) -> Result<String, String> {
                Ok("<INSERT-FILE \"a\">".into())
            }
        }
        let mut loader = Cyclic;
        let err = Preprocessor::new(&mut loader, None)
            .run("a", "<INSERT-FILE \"a\">")
            .unwrap_err();
        assert!(matches!(err, FrontendError::IncludeCycle { .. }));
    }

    #[test]
    fn includes_splice_text() {
        struct One;
        impl SourceLoader for One {
            fn load(&mut self, name: &str) -> Result<String, String> {
                assert_eq!(name, "defs");
                Ok("<GLOBAL SCORE 0>".into())
            }
        }
        let mut loader = One;
        let p = Preprocessor::new(&mut loader, None)
            .run("main.zil", "<INSERT-FILE \"defs\"> <ROUTINE GO () <QUIT>>")
            .unwrap();
        assert!(p.text.contains("<GLOBAL SCORE 0>"));
        assert!(p.text.contains("<ROUTINE GO"));
    }

    #[test]
    fn locations_survive_inclusion() {
        struct One;
        impl SourceLoader for One {
            fn load(&mut self, _: &str) -> Result<String, String> {
                Ok("<GLOBAL A 1>\n<GLOBAL B 2>".into())
            }
        }
        let mut loader = One;
        let p = Preprocessor::new(&mut loader, None)
            .run("main.zil", "<INSERT-FILE \"x\">\n<GLOBAL C 3>")
            .unwrap();
        let b_at = p.text.find("<GLOBAL B").unwrap();
        let loc = p.map.location(b_at);
        assert_eq!(loc.file, "x");
        assert_eq!(loc.line, 2);
        let c_at = p.text.find("<GLOBAL C").unwrap();
        let loc = p.map.location(c_at);
        assert_eq!(loc.file, "main.zil");
        assert_eq!(loc.line, 2);
    }

    #[test]
    fn unbalanced_reports_location() {
        let mut loader = NoIncludes;
        let err = Preprocessor::new(&mut loader, None)
            .run("t.zil", "<IFFLAG (X <FOO)>")
            .unwrap_err();
        assert!(matches!(err, FrontendError::Unbalanced { .. }));
    }

    #[test]
    fn control_characters_normalize() {
        let p = run("<GLOBAL\x0cX 1>");
        assert!(p.text.contains("<GLOBAL X 1>"));
    }
}
