//! Breakpoint placement.
//!
//! Turns a requested source line into code addresses. When the line itself
//! has no code the breakpoint moves forward to the closest line that does,
//! provided that line belongs to a scope the requested line is already
//! inside. Moving is reported with a low severity diagnostic; finding
//! nothing is a general error with no addresses.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use tracing::{debug, info};

use crate::symbols::{DebugInfoEntry, Resolver, SymbolDatabase};
use crate::types::{Address, SourcePosition};

/// How bad a placement problem is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity
{
    /// The breakpoint could not be bound at all
    GeneralError,
    /// The breakpoint was bound to a different line
    Low,
}

impl fmt::Display for DiagnosticSeverity
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::GeneralError => write!(f, "error"),
            Self::Low => write!(f, "info"),
        }
    }
}

/// One placement message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointDiagnostic
{
    pub severity: DiagnosticSeverity,
    pub message: String,
    /// Where the breakpoint ended up, when it moved (DWARF line numbering)
    pub location: Option<SourcePosition>,
}

/// Result of resolving one breakpoint request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointResolution
{
    /// Process addresses to patch, in address order
    pub addresses: Vec<Address>,
    pub diagnostics: Vec<BreakpointDiagnostic>,
    /// Line the addresses belong to (DWARF line numbering)
    pub resolved_line: Option<u32>,
}

impl BreakpointResolution
{
    /// Whether at least one address was found.
    #[must_use]
    pub fn is_bound(&self) -> bool
    {
        !self.addresses.is_empty()
    }

    /// Whether resolution failed outright.
    #[must_use]
    pub fn has_errors(&self) -> bool
    {
        self.diagnostics
            .iter()
            .any(|diagnostic| diagnostic.severity == DiagnosticSeverity::GeneralError)
    }

    fn error(message: String) -> Self
    {
        Self {
            addresses: Vec::new(),
            diagnostics: vec![BreakpointDiagnostic {
                severity: DiagnosticSeverity::GeneralError,
                message,
                location: None,
            }],
            resolved_line: None,
        }
    }
}

/// Breakpoint placement over a resolver's symbols.
pub struct BreakpointLocator<'a>
{
    resolver: &'a Resolver,
}

impl<'a> BreakpointLocator<'a>
{
    pub fn new(resolver: &'a Resolver) -> Self
    {
        Self { resolver }
    }

    /// Resolve a request using the IDE's 0-based line numbering.
    #[must_use]
    pub fn resolve_ide_line(&self, path: &Path, line: u32) -> BreakpointResolution
    {
        self.resolve_line(path, crate::ide::dwarf_line(line))
    }

    /// Resolve a request for DWARF (1-based) `line` of the file at `path`.
    #[must_use]
    pub fn resolve_line(&self, path: &Path, line: u32) -> BreakpointResolution
    {
        let database = self.resolver.database();
        let files = self.resolver.matching_files(path);
        if files.is_empty() {
            debug!(path = %path.display(), "no matching source file");
            return BreakpointResolution::error(format!(
                "No code is compiled for {} in the loaded module",
                path.display()
            ));
        }

        let candidate_lines: BTreeSet<u32> = files
            .iter()
            .flat_map(|file| database.locations_for_file(file.key))
            .filter(|location| location.line >= line)
            .filter(|location| {
                database
                    .scope_for_address(location.start)
                    .is_some_and(|scope| is_suitable(database, scope, line))
            })
            .map(|location| location.line)
            .collect();

        let Some(&resolved) = candidate_lines.first() else {
            debug!(path = %path.display(), line, "no suitable line");
            return BreakpointResolution::error(format!(
                "The breakpoint at {}:{line} does not map to any code",
                path.display()
            ));
        };

        let addresses = self.resolver.addresses_from_position(path, resolved);
        let mut diagnostics = Vec::new();
        if resolved != line {
            info!(path = %path.display(), requested = line, resolved, "breakpoint moved");
            diagnostics.push(BreakpointDiagnostic {
                severity: DiagnosticSeverity::Low,
                message: format!("Breakpoint moved from line {line} to line {resolved}"),
                location: Some(SourcePosition {
                    path: path.to_path_buf(),
                    line: resolved,
                    column: 0,
                }),
            });
        }

        BreakpointResolution {
            addresses,
            diagnostics,
            resolved_line: Some(resolved),
        }
    }
}

/// A row owned by `scope` may take a breakpoint requested at `line` when
/// the scope has already begun by `line`, or when the scope is a nested
/// block whose enclosing scope has.
fn is_suitable(database: &SymbolDatabase, scope: &DebugInfoEntry, line: u32) -> bool
{
    let begins_by = |entry: &DebugInfoEntry| {
        database
            .first_line_of_scope(entry.key)
            .is_some_and(|first| first <= line)
    };
    if begins_by(scope) {
        return true;
    }
    scope.is_block()
        && scope
            .outer_scope
            .and_then(|outer| database.entry(outer))
            .is_some_and(begins_by)
}
