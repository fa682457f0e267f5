//! The ZIL front end.
//!
//! Turns raw ZIL/ZILF source text into typed top-level declarations:
//!
//! 1. [`preprocess`]: file inclusion, compilation flags, `%<COND>` /
//!    `VERSION?` / `IFFLAG` branch selection on the raw text.
//! 2. [`lexer`]: tokens, including the context-sensitive `;` rule.
//! 3. [`parser`]: generic [`Value`] forms.
//! 4. [`expand`]: `DEFMAC` macro expansion to a fixed point.
//! 5. [`decl`]: recognition of expanded forms into a typed [`Program`].
//!
//! The front end performs no file I/O itself; `INSERT-FILE` resolves
//! through the [`SourceLoader`] trait supplied by the driver.

pub mod decl;
pub mod error;
pub mod expand;
pub mod intern;
pub mod lexer;
pub mod parser;
pub mod preprocess;
pub mod value;

pub use crate::decl::{Program, RoutineDef};
pub use crate::error::{FrontendError, Location};
pub use crate::intern::{Atom, Interner};
pub use crate::preprocess::SourceLoader;
pub use crate::value::Value;
