//! # Resolver
//!
//! Address and source position mapping, scope and variable enumeration and
//! type naming on top of one module's [`SymbolDatabase`].
//!
//! The database stores module-relative addresses; the resolver adds the
//! module's load base on the way out and subtracts it on the way in, so every
//! address crossing this API is a process address.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use gimli::{constants, DwAte};
use tracing::{debug, info, trace, warn};

use super::database::{SourceFile, SymbolDatabase};
use super::demangle::demangle_name;
use super::entry::{AttributeValue, DebugInfoEntry, EntryKey};
use super::loader;
use crate::types::{Address, Function, Registers, SourcePosition, Symbol, SymbolLocation, SymbolType, TypeKind};
use crate::unwind::{evaluate, FrameContext, Location, MemoryAccess, Unwinder};

/// Type chains longer than this are treated as malformed.
const MAX_TYPE_DEPTH: usize = 32;

/// Outcome of [`Resolver::load_module`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStatus
{
    pub loaded: bool,
    /// Human-readable summary or failure reason
    pub message: String,
}

/// Symbol queries for one module loaded at a fixed base address.
#[derive(Debug, Clone, Default)]
pub struct Resolver
{
    database: Arc<SymbolDatabase>,
    base: Address,
    module: Option<PathBuf>,
}

impl Resolver
{
    /// Resolver with no symbols.
    #[must_use]
    pub fn empty() -> Self
    {
        Self::default()
    }

    /// Resolver over an already indexed database.
    #[must_use]
    pub fn from_database(database: SymbolDatabase, base: Address) -> Self
    {
        Self {
            database: Arc::new(database),
            base,
            module: None,
        }
    }

    /// Parse `path` and replace the current symbols with it.
    ///
    /// Failure leaves the resolver empty; the session carries on without
    /// symbols.
    pub fn load_module(&mut self, path: &Path, base: Address) -> LoadStatus
    {
        self.base = base;
        match loader::load_module(path) {
            Ok(database) => {
                let stats = database.stats();
                info!(
                    path = %path.display(),
                    %base,
                    entries = stats.entries,
                    files = stats.files,
                    locations = stats.locations,
                    call_frames = stats.call_frames,
                    "symbols loaded"
                );
                self.database = Arc::new(database);
                self.module = Some(path.to_path_buf());
                LoadStatus {
                    loaded: true,
                    message: format!(
                        "Loaded symbols for {} ({} entries, {} source files, {} line rows)",
                        path.display(),
                        stats.entries,
                        stats.files,
                        stats.locations
                    ),
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to load symbols");
                self.database = Arc::new(SymbolDatabase::empty());
                self.module = None;
                LoadStatus {
                    loaded: false,
                    message: format!("Failed to load symbols for {}: {err}", path.display()),
                }
            }
        }
    }

    #[must_use]
    pub fn database(&self) -> &SymbolDatabase
    {
        &self.database
    }

    /// Shared handle to the database for concurrent readers.
    #[must_use]
    pub fn shared_database(&self) -> Arc<SymbolDatabase>
    {
        Arc::clone(&self.database)
    }

    /// Load base added to every module-relative address.
    #[must_use]
    pub const fn base(&self) -> Address
    {
        self.base
    }

    /// Move the module to a new load base.
    pub fn set_base(&mut self, base: Address)
    {
        self.base = base;
    }

    #[must_use]
    pub fn module_path(&self) -> Option<&Path>
    {
        self.module.as_deref()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool
    {
        !self.database.is_empty()
    }

    /// Module-relative form of a process address.
    #[must_use]
    pub fn relative(&self, address: Address) -> Option<u64>
    {
        address.relative_to(self.base)
    }

    /// Process address of a module-relative address.
    #[must_use]
    pub fn absolute(&self, relative: u64) -> Address
    {
        self.base + relative
    }

    /// Source position covering `address` (DWARF line numbering).
    #[must_use]
    pub fn position_from_address(&self, address: Address) -> Option<SourcePosition>
    {
        let relative = self.relative(address)?;
        let location = self
            .database
            .location_for_address(relative)
            .filter(|location| location.contains(relative))?;
        let file = self.database.file(location.file)?;
        Some(SourcePosition {
            path: file.current_path(),
            line: location.line,
            column: location.column,
        })
    }

    /// Every address whose line row is exactly `line` of the file named by
    /// `path` (DWARF line numbering), in address order.
    ///
    /// `path` is recorded as the file's current absolute path.
    #[must_use]
    pub fn addresses_from_position(&self, path: &Path, line: u32) -> Vec<Address>
    {
        let mut addresses: Vec<Address> = self
            .matching_files(path)
            .into_iter()
            .flat_map(|file| self.database.locations_for_file(file.key))
            .filter(|location| location.line == line)
            .map(|location| self.absolute(location.start))
            .collect();
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    /// Source files that `path` refers to.
    ///
    /// Candidates must share the basename. Among several, the one whose
    /// declared path shares the longest trailing run of components with
    /// `path` wins (the first on ties); files declared with that same path in
    /// other compilation units are included too. Every returned file has its
    /// current path set to `path`.
    #[must_use]
    pub fn matching_files(&self, path: &Path) -> Vec<&SourceFile>
    {
        let Some(basename) = path.file_name().and_then(|name| name.to_str()) else {
            return Vec::new();
        };
        let candidates: Vec<&SourceFile> = self.database.files_by_name(basename).collect();
        let mut best: Option<(&SourceFile, usize)> = None;
        for &candidate in &candidates {
            let score = shared_suffix(&candidate.declared_path(), path);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((candidate, score));
            }
        }
        let Some((chosen, _)) = best else {
            trace!(path = %path.display(), "no source file with this name");
            return Vec::new();
        };

        let declared = chosen.declared_path();
        let files: Vec<&SourceFile> = candidates
            .into_iter()
            .filter(|file| file.declared_path() == declared)
            .collect();
        for file in &files {
            file.set_current_path(path);
        }
        files
    }

    /// The subprogram containing `address`, or the unknown sentinel.
    #[must_use]
    pub fn function_from_address(&self, address: Address) -> Function
    {
        self.subprogram_for_address(address)
            .map_or_else(Function::unknown, |entry| self.function(entry))
    }

    fn subprogram_for_address(&self, address: Address) -> Option<&DebugInfoEntry>
    {
        let relative = self.relative(address)?;
        let scope = self.database.scope_for_address(relative)?;
        self.database
            .nearest_scope_with_tag(scope.key, constants::DW_TAG_subprogram)
    }

    fn function(&self, entry: &DebugInfoEntry) -> Function
    {
        let range = match (entry.low_pc(), entry.high_pc()) {
            (Some(low), Some(high)) if high > low => Some((self.absolute(low), self.absolute(high))),
            _ => {
                let ranges = self.database.range_list(entry.key);
                let low = ranges.iter().map(|range| range.base + range.low).min();
                let high = ranges.iter().map(|range| range.base + range.high).max();
                low.zip(high).map(|(low, high)| (self.absolute(low), self.absolute(high)))
            }
        };
        Function {
            key: Some(entry.key),
            name: self
                .function_name(entry)
                .unwrap_or_else(|| Function::UNKNOWN_NAME.to_string()),
            range,
        }
    }

    /// `DW_AT_name`, else demangled `DW_AT_linkage_name`, looking through
    /// `DW_AT_specification` and `DW_AT_abstract_origin`.
    fn function_name(&self, entry: &DebugInfoEntry) -> Option<String>
    {
        let mut current = Some(entry);
        for _ in 0..MAX_TYPE_DEPTH {
            let entry = current?;
            if let Some(name) = entry.name() {
                return Some(name.to_string());
            }
            let linkage = entry
                .attribute(constants::DW_AT_linkage_name)
                .or_else(|| entry.attribute(constants::DW_AT_MIPS_linkage_name))
                .and_then(AttributeValue::as_str);
            if let Some(linkage) = linkage {
                return Some(demangle_name(linkage));
            }
            current = entry
                .attribute(constants::DW_AT_specification)
                .or_else(|| entry.attribute(constants::DW_AT_abstract_origin))
                .and_then(AttributeValue::as_reference)
                .and_then(|key| self.database.entry(key));
        }
        None
    }

    /// Start address of every line row inside the function containing
    /// `address`, in address order.
    #[must_use]
    pub fn addresses_in_scope(&self, address: Address) -> Vec<Address>
    {
        let function = self.function_from_address(address);
        let Some((low, high)) = function.range else {
            return Vec::new();
        };
        let (Some(low), Some(high)) = (self.relative(low), self.relative(high)) else {
            return Vec::new();
        };

        let mut addresses = Vec::new();
        let mut cursor = low;
        while cursor < high {
            match self.database.location_for_address(cursor) {
                Some(location) if location.contains(cursor) => {
                    addresses.push(self.absolute(location.start));
                    cursor = location.end();
                }
                _ => {
                    // Skip the gap to the next row.
                    let locations = self.database.locations();
                    let next = locations.partition_point(|location| location.start <= cursor);
                    match locations.get(next) {
                        Some(location) => cursor = location.start,
                        None => break,
                    }
                }
            }
        }
        addresses
    }

    /// End of the line row covering `address`.
    #[must_use]
    pub fn next_location(&self, address: Address) -> Option<Address>
    {
        let relative = self.relative(address)?;
        self.database
            .location_for_address(relative)
            .filter(|location| location.contains(relative))
            .map(|location| self.absolute(location.end()))
    }

    /// Variables and parameters visible in the frame described by
    /// `registers`.
    ///
    /// Scopes are walked from the innermost one outwards up to and including
    /// the enclosing subprogram, so inner declarations come first. Shadowed
    /// names are not removed.
    pub fn symbols_in_scope<M: MemoryAccess + ?Sized>(&self, registers: &Registers, memory: &M) -> Vec<Symbol>
    {
        let Some(pc) = self.relative(registers.pc()) else {
            return Vec::new();
        };
        let Some(scope) = self.database.scope_for_address(pc) else {
            return Vec::new();
        };
        let Some(subprogram) = self
            .database
            .nearest_scope_with_tag(scope.key, constants::DW_TAG_subprogram)
        else {
            return Vec::new();
        };

        let cfa = match Unwinder::new(&self.database, self.base, memory).canonical_frame_address(registers) {
            Ok(cfa) => cfa,
            Err(err) => {
                debug!(error = %err, "no canonical frame address for scope lookup");
                None
            }
        };
        let frame_base = self.frame_base(subprogram, pc, registers, memory, cfa);
        let context = FrameContext::new(registers, memory, self.base)
            .with_frame_base(frame_base)
            .with_cfa(cfa);

        let mut symbols = Vec::new();
        let mut current = Some(scope);
        while let Some(scope) = current {
            for child in self.database.children_of(scope.key) {
                let (Some(name), Some(location)) = (child.name(), child.attribute(constants::DW_AT_location)) else {
                    continue;
                };
                symbols.push(Symbol {
                    key: child.key,
                    name: name.to_string(),
                    location: self.symbol_location(location, pc, &context),
                    symbol_type: child
                        .type_ref()
                        .map_or_else(SymbolType::unknown, |key| self.symbol_type(key)),
                });
            }
            if scope.key == subprogram.key {
                break;
            }
            current = scope.outer_scope.and_then(|key| self.database.entry(key));
        }
        symbols
    }

    fn expression_at<'a>(&'a self, value: &'a AttributeValue, pc: u64) -> Option<&'a [u8]>
    {
        match value {
            AttributeValue::Bytes(expression) => Some(expression),
            AttributeValue::LocationList(offset) => self
                .database
                .loc_list(*offset)?
                .iter()
                .find(|entry| entry.contains(pc))
                .map(|entry| entry.expression.as_slice()),
            _ => None,
        }
    }

    fn frame_base<M: MemoryAccess + ?Sized>(
        &self,
        subprogram: &DebugInfoEntry,
        pc: u64,
        registers: &Registers,
        memory: &M,
        cfa: Option<Address>,
    ) -> Option<u64>
    {
        let attribute = subprogram.attribute(constants::DW_AT_frame_base)?;
        let expression = self.expression_at(attribute, pc)?;
        let context = FrameContext::new(registers, memory, self.base).with_cfa(cfa);
        match evaluate(expression, &context) {
            Ok(Location::Address(value) | Location::Value(value)) => Some(value),
            Ok(Location::Register(register)) => registers.get(register),
            Err(err) => {
                debug!(function = ?subprogram.name(), error = %err, "frame base unavailable");
                None
            }
        }
    }

    fn symbol_location<M: MemoryAccess + ?Sized>(
        &self,
        attribute: &AttributeValue,
        pc: u64,
        context: &FrameContext<'_, M>,
    ) -> SymbolLocation
    {
        let Some(expression) = self.expression_at(attribute, pc) else {
            return SymbolLocation::Unavailable("not live at this address".to_string());
        };
        match evaluate(expression, context) {
            Ok(Location::Address(address)) => SymbolLocation::Memory(Address::new(address)),
            Ok(Location::Value(value)) => SymbolLocation::Value(value),
            Ok(Location::Register(register)) => {
                warn!(register, "register variables are not supported");
                SymbolLocation::Register(register)
            }
            Err(err) => SymbolLocation::Unavailable(err.to_string()),
        }
    }

    /// Flatten the type chain starting at `key`.
    ///
    /// Names read right to left the way the declaration does: a pointer to
    /// a const char is `char const *`. Kind and size come from the outermost
    /// component that has them, so `char const *` is an 8-byte pointer.
    /// Dangling references, cycles and unsupported tags give
    /// [`SymbolType::unknown`].
    #[must_use]
    pub fn symbol_type(&self, key: EntryKey) -> SymbolType
    {
        self.resolve_type(key, 0).unwrap_or_else(SymbolType::unknown)
    }

    fn resolve_type(&self, key: EntryKey, depth: usize) -> Option<SymbolType>
    {
        if depth > MAX_TYPE_DEPTH {
            return None;
        }

        let mut name = String::new();
        let mut naming = true;
        let mut kind = None;
        let mut size = None;
        let mut current = Some(key);
        let mut steps = 0;

        while let Some(type_key) = current {
            steps += 1;
            if steps > MAX_TYPE_DEPTH {
                trace!(%key, "type chain too deep");
                return None;
            }
            let entry = self.database.entry(type_key)?;
            let mut next = entry.type_ref();

            let token = match entry.tag {
                constants::DW_TAG_const_type => "const".to_string(),
                constants::DW_TAG_volatile_type => "volatile".to_string(),
                constants::DW_TAG_restrict_type => "restrict".to_string(),
                constants::DW_TAG_pointer_type => {
                    kind.get_or_insert(TypeKind::Pointer);
                    size.get_or_insert(entry.byte_size().unwrap_or(8));
                    "*".to_string()
                }
                constants::DW_TAG_reference_type | constants::DW_TAG_rvalue_reference_type => {
                    kind.get_or_insert(TypeKind::Pointer);
                    size.get_or_insert(entry.byte_size().unwrap_or(8));
                    "&".to_string()
                }
                constants::DW_TAG_base_type => {
                    kind.get_or_insert(base_kind(entry));
                    if let Some(bytes) = entry.byte_size() {
                        size.get_or_insert(bytes);
                    }
                    next = None;
                    entry.name().unwrap_or("<base>").to_string()
                }
                constants::DW_TAG_structure_type | constants::DW_TAG_class_type | constants::DW_TAG_union_type => {
                    kind.get_or_insert(TypeKind::Struct);
                    if let Some(bytes) = entry.byte_size() {
                        size.get_or_insert(bytes);
                    }
                    next = None;
                    let keyword = if entry.tag == constants::DW_TAG_union_type { "union" } else { "struct" };
                    format!("{keyword} {}", entry.name().unwrap_or("<anonymous>"))
                }
                constants::DW_TAG_enumeration_type => {
                    kind.get_or_insert(TypeKind::Int);
                    size.get_or_insert(entry.byte_size().unwrap_or(4));
                    next = None;
                    format!("enum {}", entry.name().unwrap_or("<anonymous>"))
                }
                constants::DW_TAG_typedef => entry.name().unwrap_or("<typedef>").to_string(),
                constants::DW_TAG_array_type => {
                    kind.get_or_insert(TypeKind::Struct);
                    let count = self.array_length(entry);
                    if size.is_none() {
                        size = entry.byte_size().or_else(|| {
                            let element = self.resolve_type(next?, depth + 1)?;
                            count.map(|count| count * element.size)
                        });
                    }
                    count.map_or_else(|| "[]".to_string(), |count| format!("[{count}]"))
                }
                constants::DW_TAG_subroutine_type => format!("({})", self.parameter_list(entry, depth)),
                other => {
                    trace!(tag = %other, "unsupported tag in type chain");
                    return None;
                }
            };

            if naming {
                prepend(&mut name, &token);
                if matches!(
                    entry.tag,
                    constants::DW_TAG_typedef
                        | constants::DW_TAG_base_type
                        | constants::DW_TAG_structure_type
                        | constants::DW_TAG_class_type
                        | constants::DW_TAG_union_type
                        | constants::DW_TAG_enumeration_type
                ) {
                    naming = false;
                } else if next.is_none() {
                    prepend(&mut name, "void");
                }
            }
            current = next;
        }

        Some(SymbolType {
            key: Some(key),
            name,
            size: size.unwrap_or(0),
            kind: kind.unwrap_or_default(),
        })
    }

    fn parameter_list(&self, subroutine: &DebugInfoEntry, depth: usize) -> String
    {
        let parameters: Vec<String> = self
            .database
            .children_of(subroutine.key)
            .filter_map(|child| match child.tag {
                constants::DW_TAG_formal_parameter => Some(
                    child
                        .type_ref()
                        .and_then(|key| self.resolve_type(key, depth + 1))
                        .map_or_else(|| SymbolType::unknown().name, |resolved| resolved.name),
                ),
                constants::DW_TAG_unspecified_parameters => Some("...".to_string()),
                _ => None,
            })
            .collect();
        parameters.join(", ")
    }

    fn array_length(&self, array: &DebugInfoEntry) -> Option<u64>
    {
        let subrange = self
            .database
            .children_of(array.key)
            .find(|child| child.tag == constants::DW_TAG_subrange_type)?;
        subrange
            .attribute(constants::DW_AT_count)
            .and_then(AttributeValue::as_unsigned)
            .or_else(|| {
                subrange
                    .attribute(constants::DW_AT_upper_bound)
                    .and_then(AttributeValue::as_unsigned)
                    .map(|upper| upper + 1)
            })
    }
}

fn base_kind(entry: &DebugInfoEntry) -> TypeKind
{
    let encoding = entry
        .attribute(constants::DW_AT_encoding)
        .and_then(AttributeValue::as_unsigned)
        .and_then(|value| u8::try_from(value).ok())
        .map(DwAte);
    match encoding {
        Some(constants::DW_ATE_boolean) => TypeKind::Bool,
        Some(constants::DW_ATE_signed_char | constants::DW_ATE_unsigned_char | constants::DW_ATE_UTF) => TypeKind::Char,
        Some(constants::DW_ATE_signed) => TypeKind::Int,
        Some(constants::DW_ATE_unsigned | constants::DW_ATE_address) => TypeKind::UInt,
        Some(constants::DW_ATE_float) => TypeKind::Float,
        _ => TypeKind::Unknown,
    }
}

fn prepend(name: &mut String, token: &str)
{
    if name.is_empty() {
        name.push_str(token);
    } else {
        name.insert(0, ' ');
        name.insert_str(0, token);
    }
}

/// Number of trailing path components `declared` and `requested` share.
fn shared_suffix(declared: &Path, requested: &Path) -> usize
{
    let normal = |path: &Path| -> Vec<String> {
        path.components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    };
    let declared = normal(declared);
    let requested = normal(requested);
    declared
        .iter()
        .rev()
        .zip(requested.iter().rev())
        .take_while(|(left, right)| left == right)
        .count()
}
