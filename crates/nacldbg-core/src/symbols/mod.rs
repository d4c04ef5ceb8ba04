//! # Symbols
//!
//! Debug information for one module: the entry arena and indexed
//! [`SymbolDatabase`], DWARF ingestion and the [`Resolver`] that answers
//! address, source position, scope and type queries.

mod database;
mod demangle;
mod entry;
pub mod loader;
mod resolver;

pub use database::{
    CallFrame, DatabaseBuilder, DatabaseStats, FileKey, LocListEntry, RangeListEntry, Rule, RuleKind, RuleRegister,
    ScopeTransition, SourceFile, SourceLocation, SymbolDatabase,
};
pub use demangle::demangle_name;
pub use entry::{is_scope_tag, AttributeValue, Attributes, DebugInfoEntry, EntryKey};
/// DWARF constants (`DW_TAG_*`, `DW_AT_*`, ...) for building entries.
pub use gimli::constants as dwarf;
pub use loader::{load_from_bytes, load_module};
pub use resolver::{LoadStatus, Resolver};
