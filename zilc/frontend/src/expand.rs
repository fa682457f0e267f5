//! Macro expansion and compile-time evaluation.
//!
//! Two related but distinct walks:
//!
//! * [`Expander::expand`] rewrites *runtime* code: wherever a form's
//!   operator names a `DEFMAC`, the macro is applied and the result is
//!   spliced in, repeatedly, until no macro heads remain. Nothing else
//!   in runtime code is evaluated.
//! * `eval` runs *inside* a macro application: the macro body is MDL
//!   code executed at expansion time, with `FORM`/`LIST` constructing
//!   the replacement, `QUOTE` protecting templates verbatim, and a
//!   working set of arithmetic and list builtins.
//!
//! Expansion depth is bounded so a self-reproducing macro is reported
//! instead of hanging the compiler.

use log::trace;
use rustc_hash::FxHashMap;

use crate::error::{FrontendError, Location};
use crate::intern::{Atom, Interner};
use crate::parser::TopLevel;
use crate::value::Value;

/// Gives up on a single call site after this many rewrites.
const EXPANSION_LIMIT: usize = 64;

#[derive(Clone, Debug)]
enum ParamKind {
    Required,
    /// `'NAME`: bound to the argument verbatim.
    Quoted,
    Optional(Option<Value>),
    Aux(Option<Value>),
    /// `"ARGS"` / `"TUPLE"`: the unevaluated argument tail.
    Tuple,
}

#[derive(Clone, Debug)]
struct Param {
    name: Atom,
    kind: ParamKind,
}

#[derive(Clone, Debug)]
pub struct MacroDef {
    name: Atom,
    params: Vec<Param>,
    body: Vec<Value>,
}

type Bindings = FxHashMap<Atom, Value>;

pub struct Expander<'a> {
    interner: &'a mut Interner,
    macros: FxHashMap<Atom, MacroDef>,
    /// Compile-time globals from `SETG`.
    env: FxHashMap<Atom, Value>,
    /// Location of the top-level form being expanded, for errors.
    loc: Location,
}

impl<'a> Expander<'a> {
    pub fn new(interner: &'a mut Interner) -> Self {
        Expander {
            interner,
            macros: FxHashMap::default(),
            env: FxHashMap::default(),
            loc: Location::default(),
        }
    }

    /// Number of `DEFMAC` definitions seen.
    pub fn macro_count(&self) -> usize {
        self.macros.len()
    }

    /// Expand a whole program. `DEFMAC` and `SETG` forms are consumed
    /// here; everything else is macro-expanded and passed through.
    pub fn expand_program(
        mut self,
        tops: Vec<TopLevel>,
        map: &crate::preprocess::SourceMap,
    ) -> Result<Vec<TopLevel>, FrontendError> {
        let defmac = self.interner.intern("DEFMAC");
        let define = self.interner.intern("DEFINE");
        let setg = self.interner.intern("SETG");

        let mut out = Vec::with_capacity(tops.len());
        for top in tops {
            self.loc = map.location(top.offset);
            if let Some(head) = top.value.form_head() {
                if head == defmac || head == define {
                    self.define_macro(&top.value)?;
                    continue;
                }
                if head == setg {
                    self.record_setg(&top.value)?;
                    continue;
                }
            }
            let expanded = self.expand(top.value, 0)?;
            match expanded {
                // A macro may expand to several top-level forms.
                Value::Splice(items) => {
                    for value in items {
                        out.push(TopLevel { value, offset: top.offset });
                    }
                }
                v if v.is_false() => {}
                value => out.push(TopLevel { value, offset: top.offset }),
            }
        }
        Ok(out)
    }

    fn atom_name(&self, a: Atom) -> &str {
        self.interner.name(a)
    }

    fn err(&self, message: impl Into<String>) -> FrontendError {
        FrontendError::Other { loc: self.loc.clone(), message: message.into() }
    }

    fn define_macro(&mut self, form: &Value) -> Result<(), FrontendError> {
        let Value::Form(items) = form else { unreachable!() };
        let (name, params, body) = match items.as_slice() {
            [_, Value::Atom(name), Value::List(params), body @ ..] if !body.is_empty() => {
                (*name, params, body)
            }
            _ => return Err(self.err("malformed DEFMAC: expected <DEFMAC name (params) body…>")),
        };
        let params = self.parse_params(params)?;
        trace!("macro {} defined with {} parameter(s)", self.atom_name(name), params.len());
        self.macros
            .insert(name, MacroDef { name, params, body: body.to_vec() });
        Ok(())
    }

    fn parse_params(&mut self, list: &[Value]) -> Result<Vec<Param>, FrontendError> {
        #[derive(PartialEq)]
        enum Mode {
            Required,
            Optional,
            Aux,
            Tuple,
        }
        let mut mode = Mode::Required;
        let mut out = Vec::new();
        for item in list {
            match item {
                Value::String(s) => {
                    mode = match s.to_ascii_uppercase().as_str() {
                        "OPT" | "OPTIONAL" => Mode::Optional,
                        "AUX" | "EXTRA" => Mode::Aux,
                        "ARGS" | "TUPLE" => Mode::Tuple,
                        other => return Err(self.err(format!("unknown parameter marker {other:?}"))),
                    };
                }
                Value::Atom(a) => out.push(Param {
                    name: *a,
                    kind: match mode {
                        Mode::Required => ParamKind::Required,
                        Mode::Optional => ParamKind::Optional(None),
                        Mode::Aux => ParamKind::Aux(None),
                        Mode::Tuple => ParamKind::Tuple,
                    },
                }),
                Value::Quote(inner) => {
                    let Some(a) = inner.as_atom() else {
                        return Err(self.err("quoted parameter must be an atom"));
                    };
                    out.push(Param { name: a, kind: ParamKind::Quoted });
                }
                Value::List(pair) => {
                    let [Value::Atom(a), default] = pair.as_slice() else {
                        return Err(self.err("defaulted parameter must be (name default)"));
                    };
                    let kind = match mode {
                        Mode::Optional => ParamKind::Optional(Some(default.clone())),
                        Mode::Aux => ParamKind::Aux(Some(default.clone())),
                        _ => return Err(self.err("only \"OPT\" and \"AUX\" parameters take defaults")),
                    };
                    out.push(Param { name: *a, kind });
                }
                other => {
                    let shown = other.display(self.interner);
                    return Err(self.err(format!("unexpected parameter {shown}")));
                }
            }
        }
        Ok(out)
    }

    fn record_setg(&mut self, form: &Value) -> Result<(), FrontendError> {
        let Value::Form(items) = form else { unreachable!() };
        let [_, Value::Atom(name), value] = items.as_slice() else {
            return Err(self.err("malformed SETG"));
        };
        let value = self.eval(value.clone(), &Bindings::default(), 0)?;
        self.env.insert(*name, value);
        Ok(())
    }

    /// Rewrite runtime code: apply macros at form heads, recurse into
    /// aggregates, splice `SPLICE` results.
    pub fn expand(&mut self, value: Value, depth: usize) -> Result<Value, FrontendError> {
        if depth > EXPANSION_LIMIT {
            return Err(FrontendError::MacroDivergence {
                loc: self.loc.clone(),
                depth,
            });
        }
        match value {
            Value::Form(items) => {
                if let Some(head) = items.first().and_then(Value::as_atom) {
                    if let Some(def) = self.macros.get(&head).cloned() {
                        let result = self.apply(&def, &items[1..], depth)?;
                        return self.expand(result, depth + 1);
                    }
                }
                Ok(Value::Form(self.expand_children(items, depth)?))
            }
            Value::List(items) => Ok(Value::List(self.expand_children(items, depth)?)),
            Value::Vector(items) => Ok(Value::Vector(self.expand_children(items, depth)?)),
            v => Ok(v),
        }
    }

    fn expand_children(
        &mut self,
        items: Vec<Value>,
        depth: usize,
    ) -> Result<Vec<Value>, FrontendError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match self.expand(item, depth)? {
                Value::Splice(spliced) => out.extend(spliced),
                v => out.push(v),
            }
        }
        Ok(out)
    }

    /// Apply one macro to unevaluated argument forms.
    fn apply(&mut self, def: &MacroDef, args: &[Value], depth: usize) -> Result<Value, FrontendError> {
        trace!("expanding macro {}", self.atom_name(def.name));
        let mut bindings = Bindings::default();
        let mut next = 0usize;

        let min = def
            .params
            .iter()
            .filter(|p| matches!(p.kind, ParamKind::Required | ParamKind::Quoted))
            .count();
        let has_tuple = def.params.iter().any(|p| matches!(p.kind, ParamKind::Tuple));
        let max = def
            .params
            .iter()
            .filter(|p| !matches!(p.kind, ParamKind::Aux(_)))
            .count();
        if args.len() < min || (!has_tuple && args.len() > max) {
            return Err(FrontendError::MacroArity {
                loc: self.loc.clone(),
                name: self.atom_name(def.name).to_owned(),
                want: if has_tuple {
                    format!("at least {min}")
                } else if min == max {
                    format!("{min}")
                } else {
                    format!("{min}..{max}")
                },
                got: args.len(),
            });
        }

        for param in &def.params {
            match &param.kind {
                ParamKind::Required => {
                    let arg = args.get(next).cloned().unwrap_or_else(Value::false_);
                    next += 1;
                    let v = self.eval(arg, &bindings, depth)?;
                    bindings.insert(param.name, v);
                }
                ParamKind::Quoted => {
                    let arg = args.get(next).cloned().unwrap_or_else(Value::false_);
                    bindings.insert(param.name, arg);
                    next += 1;
                }
                ParamKind::Optional(default) => {
                    let v = if next < args.len() {
                        let arg = args[next].clone();
                        next += 1;
                        self.eval(arg, &bindings, depth)?
                    } else {
                        match default {
                            Some(d) => self.eval(d.clone(), &bindings, depth)?,
                            None => Value::false_(),
                        }
                    };
                    bindings.insert(param.name, v);
                }
                ParamKind::Aux(default) => {
                    let v = match default {
                        Some(d) => self.eval(d.clone(), &bindings, depth)?,
                        None => Value::false_(),
                    };
                    bindings.insert(param.name, v);
                }
                ParamKind::Tuple => {
                    bindings.insert(param.name, Value::List(args[next..].to_vec()));
                    next = args.len();
                }
            }
        }

        let mut result = Value::false_();
        for form in &def.body {
            result = self.eval(form.clone(), &bindings, depth)?;
        }
        // A macro that returns a quoted template expands to the
        // template itself.
        if let Value::Quote(inner) = result {
            result = *inner;
        }
        Ok(result)
    }

    /// MDL-style evaluation inside a macro application.
    fn eval(&mut self, value: Value, bindings: &Bindings, depth: usize) -> Result<Value, FrontendError> {
        if depth > EXPANSION_LIMIT {
            return Err(FrontendError::MacroDivergence { loc: self.loc.clone(), depth });
        }
        match value {
            Value::Int(_) | Value::String(_) | Value::Char(_) | Value::Atom(_) | Value::Splice(_) => {
                Ok(value)
            }
            Value::Quote(inner) => Ok(Value::Quote(inner)),
            Value::List(items) => Ok(Value::List(self.eval_children(items, bindings, depth)?)),
            Value::Vector(items) => Ok(Value::Vector(self.eval_children(items, bindings, depth)?)),
            Value::Form(items) => self.eval_form(items, bindings, depth),
        }
    }

    fn eval_children(
        &mut self,
        items: Vec<Value>,
        bindings: &Bindings,
        depth: usize,
    ) -> Result<Vec<Value>, FrontendError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match self.eval(item, bindings, depth)? {
                Value::Splice(spliced) => out.extend(spliced),
                v => out.push(v),
            }
        }
        Ok(out)
    }

    fn eval_form(
        &mut self,
        items: Vec<Value>,
        bindings: &Bindings,
        depth: usize,
    ) -> Result<Value, FrontendError> {
        if items.is_empty() {
            return Ok(Value::false_());
        }
        let Some(head) = items[0].as_atom() else {
            return Ok(Value::Form(self.eval_children(items, bindings, depth)?));
        };
        let args = &items[1..];
        let name = self.atom_name(head).to_owned();
        match name.as_str() {
            "LVAL" => {
                let Some(a) = args.first().and_then(Value::as_atom) else {
                    return Err(self.err("LVAL needs an atom"));
                };
                match bindings.get(&a) {
                    Some(v) => Ok(v.clone()),
                    // Not a macro parameter: a reference to a runtime
                    // local, left for the code generator.
                    None => Ok(Value::Form(items)),
                }
            }
            "GVAL" => {
                let Some(a) = args.first().and_then(Value::as_atom) else {
                    return Err(self.err("GVAL needs an atom"));
                };
                match self.env.get(&a) {
                    Some(v) => Ok(v.clone()),
                    None => Ok(Value::Form(items)),
                }
            }
            "QUOTE" => Ok(args.first().cloned().unwrap_or_else(Value::false_)),
            "FORM" => Ok(Value::Form(self.eval_children(args.to_vec(), bindings, depth)?)),
            "LIST" => Ok(Value::List(self.eval_children(args.to_vec(), bindings, depth)?)),
            "VECTOR" => Ok(Value::Vector(self.eval_children(args.to_vec(), bindings, depth)?)),
            "SPLICE" => {
                let evaled = self.eval_children(args.to_vec(), bindings, depth)?;
                match evaled.as_slice() {
                    // A single list argument splices its elements.
                    [Value::List(items)] => Ok(Value::Splice(items.clone())),
                    _ => Ok(Value::Splice(evaled)),
                }
            }
            "CONS" => {
                let mut evaled = self.eval_children(args.to_vec(), bindings, depth)?;
                if evaled.len() != 2 {
                    return Err(self.err("CONS needs two arguments"));
                }
                let tail = evaled.pop().unwrap();
                let head = evaled.pop().unwrap();
                let mut list = match tail {
                    Value::List(l) => l,
                    v if v.is_false() => Vec::new(),
                    _ => return Err(self.err("CONS tail must be a list")),
                };
                list.insert(0, head);
                Ok(Value::List(list))
            }
            "EVAL" => {
                let v = self.eval(args.first().cloned().unwrap_or_else(Value::false_), bindings, depth)?;
                self.eval(v, bindings, depth + 1)
            }
            "PARSE" => {
                let v = self.eval(args.first().cloned().unwrap_or_else(Value::false_), bindings, depth)?;
                match v {
                    Value::String(s) => Ok(Value::Atom(self.interner.intern(&s))),
                    other => Ok(other),
                }
            }
            "SPNAME" | "PNAME" => {
                let v = self.eval(args.first().cloned().unwrap_or_else(Value::false_), bindings, depth)?;
                match v.as_atom() {
                    Some(a) => Ok(Value::String(self.atom_name(a).to_owned())),
                    None => Err(self.err("SPNAME needs an atom")),
                }
            }
            "ASCII" => {
                let v = self.eval(args.first().cloned().unwrap_or_else(Value::false_), bindings, depth)?;
                match v {
                    Value::Char(c) => Ok(Value::Int(i32::from(c))),
                    Value::Int(n) => Ok(Value::Char(n as u8)),
                    _ => Err(self.err("ASCII needs a character or code")),
                }
            }
            "+" | "-" | "*" | "/" | "MOD" | "MIN" | "MAX" => {
                self.eval_arith(&name, args, bindings, depth)
            }
            "COND" => {
                for clause in args {
                    let Value::List(clause) = clause else {
                        return Err(self.err("COND clause must be a list"));
                    };
                    let Some((pred, body)) = clause.split_first() else {
                        return Err(self.err("empty COND clause"));
                    };
                    let p = self.eval(pred.clone(), bindings, depth)?;
                    if p.is_truthy() {
                        let mut result = p;
                        for form in body {
                            result = self.eval(form.clone(), bindings, depth)?;
                        }
                        return Ok(result);
                    }
                }
                Ok(Value::false_())
            }
            "AND" => {
                let mut last = Value::Atom(self.interner.intern("T"));
                for a in args {
                    last = self.eval(a.clone(), bindings, depth)?;
                    if last.is_false() {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            "OR" => {
                for a in args {
                    let v = self.eval(a.clone(), bindings, depth)?;
                    if v.is_truthy() {
                        return Ok(v);
                    }
                }
                Ok(Value::false_())
            }
            "NOT" => {
                let v = self.eval(args.first().cloned().unwrap_or_else(Value::false_), bindings, depth)?;
                Ok(self.boolean(v.is_false()))
            }
            "==?" | "=?" | "EQUAL?" | "N==?" | "N=?" => {
                let evaled = self.eval_children(args.to_vec(), bindings, depth)?;
                let eq = evaled.windows(2).all(|w| w[0] == w[1]);
                Ok(self.boolean(if name.starts_with('N') { !eq } else { eq }))
            }
            "ZERO?" | "0?" => {
                let v = self.eval(args.first().cloned().unwrap_or_else(Value::false_), bindings, depth)?;
                Ok(self.boolean(v.as_int() == Some(0)))
            }
            "L?" | "LESS?" | "G?" | "GRTR?" => {
                let evaled = self.eval_children(args.to_vec(), bindings, depth)?;
                let (Some(a), Some(b)) = (
                    evaled.first().and_then(Value::as_int),
                    evaled.get(1).and_then(Value::as_int),
                ) else {
                    return Err(self.err(format!("{name} needs two numbers")));
                };
                let res = if name.starts_with('L') { a < b } else { a > b };
                Ok(self.boolean(res))
            }
            "NTH" => {
                let evaled = self.eval_children(args.to_vec(), bindings, depth)?;
                let (list, n) = self.list_and_index(&evaled)?;
                list.get(n - 1)
                    .cloned()
                    .ok_or_else(|| self.err(format!("NTH index {n} out of range")))
            }
            "REST" => {
                let evaled = self.eval_children(args.to_vec(), bindings, depth)?;
                let list = match evaled.first() {
                    Some(Value::List(l)) => l.clone(),
                    _ => return Err(self.err("REST needs a list")),
                };
                let n = evaled.get(1).and_then(Value::as_int).unwrap_or(1) as usize;
                Ok(Value::List(list.get(n..).unwrap_or(&[]).to_vec()))
            }
            "LENGTH" => {
                let v = self.eval(args.first().cloned().unwrap_or_else(Value::false_), bindings, depth)?;
                match v {
                    Value::List(l) | Value::Vector(l) | Value::Form(l) => {
                        Ok(Value::Int(l.len() as i32))
                    }
                    Value::String(s) => Ok(Value::Int(s.len() as i32)),
                    _ => Err(self.err("LENGTH needs a structure")),
                }
            }
            "EMPTY?" => {
                let v = self.eval(args.first().cloned().unwrap_or_else(Value::false_), bindings, depth)?;
                match v {
                    Value::List(l) | Value::Vector(l) | Value::Form(l) => {
                        Ok(self.boolean(l.is_empty()))
                    }
                    Value::String(s) => Ok(self.boolean(s.is_empty())),
                    _ => Err(self.err("EMPTY? needs a structure")),
                }
            }
            "GASSIGNED?" => {
                let a = args.first().and_then(Value::as_atom);
                Ok(self.boolean(a.is_some_and(|a| self.env.contains_key(&a))))
            }
            "SETG" => {
                let [Value::Atom(name), value] = args else {
                    return Err(self.err("malformed SETG"));
                };
                let v = self.eval(value.clone(), bindings, depth)?;
                self.env.insert(*name, v.clone());
                Ok(v)
            }
            "MAPF" | "MAPR" => self.eval_map(&name, args, bindings, depth),
            "STRING" => {
                let evaled = self.eval_children(args.to_vec(), bindings, depth)?;
                let mut s = String::new();
                for v in evaled {
                    match v {
                        Value::String(t) => s.push_str(&t),
                        Value::Char(c) => s.push(c as char),
                        Value::Atom(a) => s.push_str(self.atom_name(a)),
                        other => {
                            let shown = other.display(self.interner);
                            return Err(self.err(format!("STRING cannot absorb {shown}")));
                        }
                    }
                }
                Ok(Value::String(s))
            }
            // A macro used inside another macro's body.
            _ if self.macros.contains_key(&head) => {
                let def = self.macros.get(&head).cloned().unwrap();
                let evaled = self.eval_children(args.to_vec(), bindings, depth)?;
                self.apply(&def, &evaled, depth + 1)
            }
            // Anything else is runtime code under construction: keep the
            // form, evaluate the argument positions.
            _ => {
                let mut out = Vec::with_capacity(items.len());
                out.push(items[0].clone());
                for item in &items[1..] {
                    match self.eval(item.clone(), bindings, depth)? {
                        Value::Splice(spliced) => out.extend(spliced),
                        v => out.push(v),
                    }
                }
                Ok(Value::Form(out))
            }
        }
    }

    fn eval_arith(
        &mut self,
        op: &str,
        args: &[Value],
        bindings: &Bindings,
        depth: usize,
    ) -> Result<Value, FrontendError> {
        let evaled = self.eval_children(args.to_vec(), bindings, depth)?;
        let mut nums = Vec::with_capacity(evaled.len());
        for v in &evaled {
            match v.as_int() {
                Some(n) => nums.push(n),
                None => {
                    let shown = v.display(self.interner);
                    return Err(self.err(format!("{op} got non-numeric {shown}")));
                }
            }
        }
        let mut it = nums.into_iter();
        let first = it.next().unwrap_or(0);
        let result = match op {
            "+" => it.fold(first, i32::wrapping_add),
            "-" => {
                if args.len() == 1 {
                    -first
                } else {
                    it.fold(first, i32::wrapping_sub)
                }
            }
            "*" => it.fold(first, i32::wrapping_mul),
            "/" => it.try_fold(first, |acc, n| {
                if n == 0 {
                    None
                } else {
                    Some(acc.wrapping_div(n))
                }
            })
            .ok_or_else(|| self.err("division by zero"))?,
            "MOD" => it.try_fold(first, |acc, n| {
                if n == 0 {
                    None
                } else {
                    Some(acc.wrapping_rem(n))
                }
            })
            .ok_or_else(|| self.err("MOD by zero"))?,
            "MIN" => it.fold(first, i32::min),
            "MAX" => it.fold(first, i32::max),
            _ => unreachable!(),
        };
        Ok(Value::Int(result))
    }

    /// A deliberately small MAPF/MAPR: the function must be a literal
    /// `FUNCTION`, the collector `,LIST`, `,VECTOR`, `,STRING` or `<>`.
    fn eval_map(
        &mut self,
        op: &str,
        args: &[Value],
        bindings: &Bindings,
        depth: usize,
    ) -> Result<Value, FrontendError> {
        let [collector, function, rest @ ..] = args else {
            return Err(self.err(format!("{op} needs a collector, a function and a list")));
        };
        let collector = match collector {
            Value::Form(f) if f.is_empty() => None,
            Value::Form(f) => match f.as_slice() {
                [g, Value::Atom(a)] if g.as_atom().map(|x| self.atom_name(x)) == Some("GVAL") => {
                    Some(self.atom_name(*a).to_owned())
                }
                _ => return Err(self.err(format!("unsupported {op} collector"))),
            },
            _ => return Err(self.err(format!("unsupported {op} collector"))),
        };
        let (params, body) = self.function_parts(function, bindings, depth)?;
        let lists: Vec<Vec<Value>> = rest
            .iter()
            .map(|l| {
                let v = self.eval(l.clone(), bindings, depth)?;
                match v {
                    Value::List(l) | Value::Vector(l) => Ok(l),
                    other => {
                        let shown = other.display(self.interner);
                        Err(self.err(format!("{op} needs lists, got {shown}")))
                    }
                }
            })
            .collect::<Result<_, _>>()?;
        if lists.is_empty() || params.len() != lists.len() {
            return Err(self.err(format!("{op} arity mismatch with its function")));
        }

        let n = lists.iter().map(Vec::len).min().unwrap_or(0);
        let mut collected = Vec::new();
        let mut last = Value::false_();
        for i in 0..n {
            let mut inner = bindings.clone();
            for (p, list) in params.iter().zip(&lists) {
                let v = if op == "MAPR" {
                    Value::List(list[i..].to_vec())
                } else {
                    list[i].clone()
                };
                inner.insert(*p, v);
            }
            last = Value::false_();
            for form in &body {
                last = self.eval(form.clone(), &inner, depth + 1)?;
            }
            match last {
                Value::Splice(ref items) => collected.extend(items.iter().cloned()),
                ref v => collected.push(v.clone()),
            }
        }

        match collector.as_deref() {
            None => Ok(last),
            Some("LIST") => Ok(Value::List(collected)),
            Some("VECTOR") => Ok(Value::Vector(collected)),
            Some("STRING") => {
                let mut s = String::new();
                for v in collected {
                    match v {
                        Value::String(t) => s.push_str(&t),
                        Value::Char(c) => s.push(c as char),
                        Value::Atom(a) => s.push_str(self.atom_name(a)),
                        _ => return Err(self.err("MAPF ,STRING collected a non-string")),
                    }
                }
                Ok(Value::String(s))
            }
            Some(other) => Err(self.err(format!("unsupported {op} collector ,{other}"))),
        }
    }

    /// Accept `<FUNCTION (params) body…>` and `#FUNCTION ((params) body…)`.
    fn function_parts(
        &mut self,
        function: &Value,
        bindings: &Bindings,
        depth: usize,
    ) -> Result<(Vec<Atom>, Vec<Value>), FrontendError> {
        let _ = depth;
        // The literal is taken apart, never evaluated: its body refers
        // to parameters that are only bound per element.
        let function = match function {
            Value::Quote(inner) => (**inner).clone(),
            Value::Form(items)
                if items.first().and_then(Value::as_atom).map(|a| self.atom_name(a))
                    == Some("LVAL") =>
            {
                match items.get(1).and_then(Value::as_atom).and_then(|a| bindings.get(&a)) {
                    Some(v) => v.clone(),
                    None => return Err(self.err("MAPF/MAPR function is unbound")),
                }
            }
            other => other.clone(),
        };
        let Value::Form(items) = &function else {
            return Err(self.err("MAPF/MAPR function must be a FUNCTION"));
        };
        let is_function = items
            .first()
            .and_then(Value::as_atom)
            .map(|a| self.atom_name(a) == "FUNCTION")
            .unwrap_or(false);
        if !is_function {
            return Err(self.err("MAPF/MAPR function must be a FUNCTION"));
        }
        let (params_value, body) = match &items[1..] {
            [Value::List(single)] if matches!(single.first(), Some(Value::List(_))) => {
                // #FUNCTION ((params) body…)
                let [Value::List(p), b @ ..] = single.as_slice() else { unreachable!() };
                (p.clone(), b.to_vec())
            }
            [Value::List(p), b @ ..] => (p.clone(), b.to_vec()),
            _ => return Err(self.err("FUNCTION needs a parameter list")),
        };
        let params = params_value
            .iter()
            .map(|p| p.as_atom().ok_or_else(|| self.err("FUNCTION parameters must be atoms")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((params, body))
    }

    fn list_and_index(&self, evaled: &[Value]) -> Result<(Vec<Value>, usize), FrontendError> {
        let list = match evaled.first() {
            Some(Value::List(l)) | Some(Value::Vector(l)) | Some(Value::Form(l)) => l.clone(),
            _ => return Err(self.err("NTH needs a structure")),
        };
        let n = evaled.get(1).and_then(Value::as_int).unwrap_or(1);
        if n < 1 {
            return Err(self.err("NTH index must be positive"));
        }
        Ok((list, n as usize))
    }

    fn boolean(&mut self, b: bool) -> Value {
        if b {
            Value::Atom(self.interner.intern("T"))
        } else {
            Value::false_()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::preprocess::SourceMap;

    fn expand_src(src: &str) -> (Vec<TopLevel>, Interner) {
        let map = SourceMap::single_file("t.zil", src);
        let mut interner = Interner::new();
        let tops = Parser::new(src, &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        let expander = Expander::new(&mut interner);
        let out = expander.expand_program(tops, &map).unwrap();
        (out, interner)
    }

    fn expand_err(src: &str) -> FrontendError {
        let map = SourceMap::single_file("t.zil", src);
        let mut interner = Interner::new();
        let tops = Parser::new(src, &map, &mut interner)
            .unwrap()
            .parse_program()
            .unwrap();
        Expander::new(&mut interner)
            .expand_program(tops, &map)
            .unwrap_err()
    }

    #[test]
    fn template_macro() {
        let (out, mut i) = expand_src(
            "<DEFMAC RTRUE-MAC () '<RTRUE>> <ROUTINE GO () <RTRUE-MAC>>",
        );
        assert_eq!(out.len(), 1);
        let rendered = out[0].value.display(&mut i);
        assert_eq!(rendered, "<ROUTINE GO () <RTRUE>>");
    }

    #[test]
    fn form_builds_with_arguments() {
        let (out, mut i) = expand_src(
            "<DEFMAC DOUBLE (X) <FORM + .X .X>> <GLOBAL G <DOUBLE 21>>",
        );
        let rendered = out[0].value.display(&mut i);
        assert_eq!(rendered, "<GLOBAL G <+ 21 21>>");
    }

    #[test]
    fn quoted_parameter_is_not_evaluated() {
        let (out, mut i) = expand_src(
            "<DEFMAC GET-IT ('V) <FORM GETP .V 1>> <ROUTINE R () <GET-IT <FOO>>>",
        );
        let rendered = out[0].value.display(&mut i);
        assert!(rendered.contains("<GETP <FOO> 1>"));
    }

    #[test]
    fn compile_time_arithmetic() {
        let (out, mut i) = expand_src(
            "<DEFMAC KB (N) <* .N 1024>> <GLOBAL SIZE <KB 4>>",
        );
        assert_eq!(out[0].value.display(&mut i), "<GLOBAL SIZE 4096>");
    }

    #[test]
    fn splice_inlines() {
        let (out, mut i) = expand_src(
            "<DEFMAC TWO () <SPLICE 1 2>> <GLOBAL T3 <TABLE <TWO> 3>>",
        );
        assert_eq!(out[0].value.display(&mut i), "<GLOBAL T3 <TABLE 1 2 3>>");
    }

    #[test]
    fn setg_feeds_gval() {
        let (out, mut i) = expand_src(
            "<SETG BASE 100> <DEFMAC OFF (N) <+ ,BASE .N>> <GLOBAL X <OFF 5>>",
        );
        assert_eq!(out[0].value.display(&mut i), "<GLOBAL X 105>");
    }

    #[test]
    fn nested_macro_calls() {
        let (out, mut i) = expand_src(
            "<DEFMAC INC1 (N) <+ .N 1>> <DEFMAC INC2 (N) <INC1 <INC1 .N>>> <GLOBAL X <INC2 5>>",
        );
        assert_eq!(out[0].value.display(&mut i), "<GLOBAL X 7>");
    }

    #[test]
    fn cond_selects_at_expansion_time() {
        let (out, mut i) = expand_src(
            "<DEFMAC PICK (N) <COND (<==? .N 1> '<RTRUE>) (T '<RFALSE>)>> \
             <ROUTINE R () <PICK 2>>",
        );
        assert_eq!(out[0].value.display(&mut i), "<ROUTINE R () <RFALSE>>");
    }

    #[test]
    fn optional_and_tuple_parameters() {
        let (out, mut i) = expand_src(
            "<DEFMAC J (A \"OPT\" (B 9) \"ARGS\" R) <LIST .A .B .R>> <GLOBAL X <J 1>>",
        );
        assert_eq!(out[0].value.display(&mut i), "<GLOBAL X (1 9 ())>");
    }

    #[test]
    fn arity_errors() {
        let err = expand_err("<DEFMAC ONE (A) .A> <GLOBAL X <ONE>>");
        assert!(matches!(err, FrontendError::MacroArity { got: 0, .. }));
        let err = expand_err("<DEFMAC ONE (A) .A> <GLOBAL X <ONE 1 2>>");
        assert!(matches!(err, FrontendError::MacroArity { got: 2, .. }));
    }

    #[test]
    fn divergence_is_detected() {
        let err = expand_err("<DEFMAC LOOP () '<LOOP>> <ROUTINE R () <LOOP>>");
        assert!(matches!(err, FrontendError::MacroDivergence { .. }));
    }

    #[test]
    fn mapf_collects_a_list() {
        let (out, mut i) = expand_src(
            "<DEFMAC SQUARES ('L) <FORM TABLE <SPLICE <MAPF ,LIST <FUNCTION (X) <* .X .X>> <EVAL .L>>>>> \
             <GLOBAL X <SQUARES (1 2 3)>>",
        );
        assert_eq!(out[0].value.display(&mut i), "<GLOBAL X <TABLE 1 4 9>>");
    }
}
