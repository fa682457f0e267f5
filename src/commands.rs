//! The `zilc` CLI command.

mod compile;

pub use self::compile::CompileCommand;
