//! Instruction context for one request.
//!
//! # Pipeline
//!
//! | Step | Module | Output |
//! |------|--------|--------|
//! | 1. Select | [`selector`] | applicable fragments of one bundle |
//! | 2. Assemble | [`assembler`] | system prompt text + fragment snapshots |
//! | 3. Truncate | [`assembler::truncate_history`] | replayed turns within the token budget |
//!
//! Fragments and bundles live in a shared [`ReferenceLibrary`].

pub mod assembler;
pub mod library;
pub mod selector;
pub mod token;

pub use assembler::{
    AssembledContext, AssemblyInput, ContextAssembler, DEFAULT_BASE_PROMPT, PageContext, TruncatedHistory,
    mode_guidance, truncate_history,
};
pub use library::{DEFAULT_BUNDLE_KEY, LibraryError, ReferenceLibrary};
pub use selector::{ReferenceQuery, Selection, select};
