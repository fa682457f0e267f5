//! Z-machine target description.
//!
//! This crate knows everything about the *target* of the compiler and
//! nothing about ZIL: story-file versions and their layout parameters,
//! the 64-byte header, the opcode matrix with per-version availability,
//! packed-address arithmetic, and ZSCII/Z-character text encoding.
//!
//! The code generator and assembler in `zilc-codegen` consult this crate
//! rather than hard-coding any opcode bytes or version constants.

pub mod header;
pub mod opcodes;
pub mod text;
pub mod version;

pub use crate::opcodes::{Op, OpClass, OpcodeInfo};
pub use crate::text::{AbbrevTable, EncodeOpts, TextError};
pub use crate::version::ZVersion;
