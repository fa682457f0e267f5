//! The zilc command-line interface library.
//!
//! The binary is a thin wrapper over [`commands::CompileCommand`]; all
//! actual compilation lives in the `zilc-codegen` crate. The CLI owns
//! the only file I/O in the project: reading sources (including
//! `INSERT-FILE` resolution) and writing the finished story file in a
//! single atomic step.

pub mod commands;
