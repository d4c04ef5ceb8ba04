//! # Symbol Database
//!
//! In-memory store of one module's debug information and the indices built
//! over it.
//!
//! Population and querying are separate types. A [`DatabaseBuilder`]
//! collects entries, files, line rows, range and location lists, scope
//! transitions and call frame rules. [`DatabaseBuilder::build_indices`]
//! validates every cross reference, sorts what needs sorting and produces an
//! immutable [`SymbolDatabase`]. Index construction is the only step that can
//! reject the data.
//!
//! All addresses in this module are module-relative (as written by the
//! linker), not process addresses.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, trace};

use super::entry::{DebugInfoEntry, EntryKey};
use crate::error::{DebuggerError, Result};

/// Key of a source file: `(unit_index << 32) | file_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileKey(u64);

impl FileKey
{
    #[must_use]
    pub const fn new(raw: u64) -> Self
    {
        Self(raw)
    }

    /// Key for file `file_index` of compilation unit `unit_index`'s line table.
    #[must_use]
    pub const fn from_parts(unit_index: u32, file_index: u32) -> Self
    {
        Self(((unit_index as u64) << 32) | file_index as u64)
    }

    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

/// A file named by a line table.
#[derive(Debug)]
pub struct SourceFile
{
    /// Unique key
    pub key: FileKey,
    /// File name as written in the line table (may contain directories)
    pub name: String,
    /// Directory the line table associates with the file
    pub directory: String,
    current_path: RwLock<PathBuf>,
}

impl SourceFile
{
    fn new(key: FileKey, name: String, directory: String) -> Self
    {
        let declared = Path::new(&directory).join(&name);
        Self {
            key,
            name,
            directory,
            current_path: RwLock::new(declared),
        }
    }

    /// Path as recorded at compile time.
    #[must_use]
    pub fn declared_path(&self) -> PathBuf
    {
        Path::new(&self.directory).join(&self.name)
    }

    /// Last component of the name; the index key for lookups by file name.
    #[must_use]
    pub fn basename(&self) -> &str
    {
        basename(&self.name)
    }

    /// Where the file lives on the developer's machine.
    ///
    /// Starts as the declared path and is replaced by the path an editor
    /// supplied the last time a breakpoint was resolved in this file.
    #[must_use]
    pub fn current_path(&self) -> PathBuf
    {
        self.current_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the path an editor uses for this file.
    pub fn set_current_path(&self, path: &Path)
    {
        let mut current = self.current_path.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_path() != path {
            trace!(file = %self.name, path = %path.display(), "updating source path");
            *current = path.to_path_buf();
        }
    }
}

fn basename(name: &str) -> &str
{
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// One row of the line table: `[start, start + length)` maps to `file:line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation
{
    pub start: u64,
    pub length: u64,
    pub file: FileKey,
    /// 1-based
    pub line: u32,
    pub column: u32,
}

impl SourceLocation
{
    /// First address after the row.
    #[must_use]
    pub const fn end(&self) -> u64
    {
        self.start.saturating_add(self.length)
    }

    #[must_use]
    pub const fn contains(&self, address: u64) -> bool
    {
        address >= self.start && address < self.end()
    }
}

/// Scope change at an address; `entry` is `None` outside every scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeTransition
{
    pub address: u64,
    pub entry: Option<EntryKey>,
}

/// One `[low, high)` range of a `DW_AT_ranges` list, relative to `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeListEntry
{
    /// Entry that owns the code range
    pub owner: EntryKey,
    pub base: u64,
    pub low: u64,
    pub high: u64,
}

impl RangeListEntry
{
    /// Whether `address` (module-relative) falls in this range.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool
    {
        address
            .checked_sub(self.base)
            .is_some_and(|offset| offset >= self.low && offset < self.high)
    }
}

/// A location expression valid over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocListEntry
{
    pub start: u64,
    pub end: u64,
    pub expression: Vec<u8>,
}

impl LocListEntry
{
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool
    {
        address >= self.start && address < self.end
    }
}

/// Register named by a call frame rule.
///
/// The canonical frame address sorts before every real register so it is
/// always computed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleRegister
{
    Cfa,
    Dwarf(u16),
}

/// How to recover a register in the caller's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind
{
    /// Value is lost; keep whatever the callee has
    Undefined,
    /// Register was not modified
    SameValue,
    /// Saved in memory at `base + offset`
    Offset
    {
        base: RuleRegister,
        offset: i64,
    },
    /// Saved in another register
    Register
    {
        base: RuleRegister,
    },
    /// Value is `base + offset` (this is how the CFA itself is described)
    ValOffset
    {
        base: RuleRegister,
        offset: i64,
    },
    /// Saved at an address computed by a DWARF expression
    Expression,
    /// Value computed by a DWARF expression
    ValExpression,
}

/// A rule taking effect at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule
{
    pub address: u64,
    pub register: RuleRegister,
    pub kind: RuleKind,
}

/// Call frame information for one function, keyed by its start address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame
{
    pub address: u64,
    /// Rules in address order (stable for equal addresses)
    pub rules: Vec<Rule>,
}

impl CallFrame
{
    /// The rule in force for each register at `address`: among rules with
    /// `rule.address <= address`, the last one per register wins.
    #[must_use]
    pub fn rules_at(&self, address: u64) -> BTreeMap<RuleRegister, Rule>
    {
        let mut applicable = BTreeMap::new();
        for rule in self.rules.iter().take_while(|rule| rule.address <= address) {
            applicable.insert(rule.register, *rule);
        }
        applicable
    }
}

/// Counts for logging and the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats
{
    pub entries: usize,
    pub files: usize,
    pub locations: usize,
    pub scope_transitions: usize,
    pub call_frames: usize,
    pub loc_lists: usize,
    pub range_entries: usize,
}

/// Collects debug information before indexing.
#[derive(Debug, Default)]
pub struct DatabaseBuilder
{
    entries: Vec<DebugInfoEntry>,
    entry_slots: HashMap<EntryKey, usize>,
    files: Vec<SourceFile>,
    file_slots: HashMap<FileKey, usize>,
    locations: HashMap<u64, SourceLocation>,
    range_lists: Vec<RangeListEntry>,
    loc_lists: HashMap<u64, Vec<LocListEntry>>,
    scope_transitions: HashMap<u64, Option<EntryKey>>,
    call_frames: HashMap<u64, CallFrame>,
    orphan_rules: Vec<(u64, Rule)>,
}

impl DatabaseBuilder
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Add an entry; an entry with the same key is replaced.
    pub fn add_entry(&mut self, entry: DebugInfoEntry)
    {
        if let Some(&slot) = self.entry_slots.get(&entry.key) {
            debug!(key = %entry.key, "replacing duplicate debug info entry");
            self.entries[slot] = entry;
        } else {
            self.entry_slots.insert(entry.key, self.entries.len());
            self.entries.push(entry);
        }
    }

    /// Whether an entry with `key` was added.
    #[must_use]
    pub fn has_entry(&self, key: EntryKey) -> bool
    {
        self.entry_slots.contains_key(&key)
    }

    /// Add a source file; the first registration of a key wins.
    pub fn add_file(&mut self, key: FileKey, name: impl Into<String>, directory: impl Into<String>)
    {
        if self.file_slots.contains_key(&key) {
            return;
        }
        self.file_slots.insert(key, self.files.len());
        self.files.push(SourceFile::new(key, name.into(), directory.into()));
    }

    /// Add a line table row.
    ///
    /// Returns `false` (and drops the row) for zero-length rows and for rows
    /// whose start address is already taken; the first row at an address
    /// wins.
    pub fn add_location(&mut self, location: SourceLocation) -> bool
    {
        if location.length == 0 || self.locations.contains_key(&location.start) {
            trace!(start = location.start, line = location.line, "dropping line row");
            return false;
        }
        self.locations.insert(location.start, location);
        true
    }

    pub fn add_range_list_entry(&mut self, entry: RangeListEntry)
    {
        self.range_lists.push(entry);
    }

    /// Append an entry to the location list at `offset`.
    pub fn add_loc_list_entry(&mut self, offset: u64, entry: LocListEntry)
    {
        self.loc_lists.entry(offset).or_default().push(entry);
    }

    /// Whether the location list at `offset` has been ingested.
    #[must_use]
    pub fn has_loc_list(&self, offset: u64) -> bool
    {
        self.loc_lists.contains_key(&offset)
    }

    /// Record that `entry` owns the code starting at `address`, replacing
    /// any earlier transition at the same address.
    pub fn add_scope_transition(&mut self, address: u64, entry: Option<EntryKey>)
    {
        self.scope_transitions.insert(address, entry);
    }

    /// Scope transition already recorded at `address`, if any.
    #[must_use]
    pub fn scope_transition(&self, address: u64) -> Option<Option<EntryKey>>
    {
        self.scope_transitions.get(&address).copied()
    }

    /// Start a call frame at `address`. Starting an existing frame again is a
    /// no-op.
    pub fn add_call_frame(&mut self, address: u64)
    {
        self.call_frames.entry(address).or_insert_with(|| CallFrame {
            address,
            rules: Vec::new(),
        });
    }

    /// Add a rule to the call frame starting at `frame_address`.
    ///
    /// A rule for a frame that was never started is kept aside and rejected
    /// by [`DatabaseBuilder::build_indices`].
    pub fn add_rule(&mut self, frame_address: u64, rule: Rule)
    {
        match self.call_frames.get_mut(&frame_address) {
            Some(frame) => frame.rules.push(rule),
            None => self.orphan_rules.push((frame_address, rule)),
        }
    }

    /// Validate cross references and build the query indices.
    ///
    /// Checks run in a fixed order over sorted data, so a given input always
    /// fails with the same error.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::CorruptDatabase`] when an entry's parent or outer
    /// scope, a scope transition, a range list owner or a line row's file
    /// names something that was never added, when outer-scope links form a
    /// cycle, or when a rule belongs to a call frame that was never started.
    pub fn build_indices(self) -> Result<SymbolDatabase>
    {
        let Self {
            entries,
            entry_slots,
            files,
            file_slots,
            locations,
            range_lists,
            loc_lists,
            scope_transitions,
            call_frames,
            mut orphan_rules,
        } = self;

        for entry in &entries {
            if let Some(parent) = entry.parent {
                if !entry_slots.contains_key(&parent) {
                    return Err(corrupt(format!("entry {} has unknown parent {parent}", entry.key)));
                }
            }
            if let Some(outer) = entry.outer_scope {
                if !entry_slots.contains_key(&outer) {
                    return Err(corrupt(format!("entry {} has unknown outer scope {outer}", entry.key)));
                }
            }
        }
        check_outer_scope_cycles(&entries, &entry_slots)?;

        let mut transitions: Vec<ScopeTransition> = scope_transitions
            .into_iter()
            .map(|(address, entry)| ScopeTransition { address, entry })
            .collect();
        transitions.sort_by_key(|transition| transition.address);
        for transition in &transitions {
            if let Some(key) = transition.entry {
                if !entry_slots.contains_key(&key) {
                    return Err(corrupt(format!(
                        "scope transition at 0x{:x} references unknown entry {key}",
                        transition.address
                    )));
                }
            }
        }

        orphan_rules.sort_by_key(|(frame, rule)| (*frame, rule.address));
        if let Some((frame, rule)) = orphan_rules.first() {
            return Err(corrupt(format!(
                "rule at 0x{:x} belongs to call frame 0x{frame:x} that was never added",
                rule.address
            )));
        }

        let mut range_index: HashMap<EntryKey, Vec<RangeListEntry>> = HashMap::new();
        for range in range_lists {
            if !entry_slots.contains_key(&range.owner) {
                return Err(corrupt(format!("range list entry owned by unknown entry {}", range.owner)));
            }
            range_index.entry(range.owner).or_default().push(range);
        }

        let mut sorted_locations: Vec<SourceLocation> = locations.into_values().collect();
        sorted_locations.sort_by_key(|location| location.start);
        for location in &sorted_locations {
            if !file_slots.contains_key(&location.file) {
                return Err(corrupt(format!(
                    "line row at 0x{:x} references unknown file {:x}",
                    location.start,
                    location.file.raw()
                )));
            }
        }

        let mut children: HashMap<EntryKey, Vec<usize>> = HashMap::new();
        for (slot, entry) in entries.iter().enumerate() {
            if let Some(parent) = entry.parent {
                children.entry(parent).or_default().push(slot);
            }
        }

        let mut files_by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (slot, file) in files.iter().enumerate() {
            files_by_name.entry(file.basename().to_string()).or_default().push(slot);
        }

        let mut locations_by_file: HashMap<FileKey, Vec<usize>> = HashMap::new();
        for (slot, location) in sorted_locations.iter().enumerate() {
            locations_by_file.entry(location.file).or_default().push(slot);
        }

        let mut frames: Vec<CallFrame> = call_frames.into_values().collect();
        frames.sort_by_key(|frame| frame.address);
        for frame in &mut frames {
            frame.rules.sort_by_key(|rule| rule.address);
        }

        let mut database = SymbolDatabase {
            entries,
            entry_slots,
            children,
            files,
            file_slots,
            files_by_name,
            locations: sorted_locations,
            locations_by_file,
            locations_by_scope: HashMap::new(),
            scope_transitions: transitions,
            range_lists: range_index,
            loc_lists,
            call_frames: frames,
        };
        database.locations_by_scope = database.group_locations_by_scope();

        debug!(stats = ?database.stats(), "symbol database indexed");
        Ok(database)
    }
}

fn corrupt(message: String) -> DebuggerError
{
    DebuggerError::CorruptDatabase(message)
}

fn check_outer_scope_cycles(entries: &[DebugInfoEntry], slots: &HashMap<EntryKey, usize>) -> Result<()>
{
    let mut acyclic: HashSet<EntryKey> = HashSet::new();
    for entry in entries {
        let mut path = Vec::new();
        let mut current = entry.outer_scope;
        while let Some(key) = current {
            if acyclic.contains(&key) {
                break;
            }
            if key == entry.key || path.contains(&key) {
                return Err(corrupt(format!("outer scope links of entry {} form a cycle", entry.key)));
            }
            path.push(key);
            current = slots.get(&key).and_then(|&slot| entries[slot].outer_scope);
        }
        acyclic.insert(entry.key);
        acyclic.extend(path);
    }
    Ok(())
}

/// Immutable, indexed debug information for one module.
///
/// Only `SourceFile::current_path` changes after construction, behind its own
/// lock, so the database can be shared between threads without further
/// synchronisation.
#[derive(Debug, Default)]
pub struct SymbolDatabase
{
    entries: Vec<DebugInfoEntry>,
    entry_slots: HashMap<EntryKey, usize>,
    children: HashMap<EntryKey, Vec<usize>>,
    files: Vec<SourceFile>,
    file_slots: HashMap<FileKey, usize>,
    files_by_name: HashMap<String, Vec<usize>>,
    locations: Vec<SourceLocation>,
    locations_by_file: HashMap<FileKey, Vec<usize>>,
    locations_by_scope: HashMap<EntryKey, Vec<usize>>,
    scope_transitions: Vec<ScopeTransition>,
    range_lists: HashMap<EntryKey, Vec<RangeListEntry>>,
    loc_lists: HashMap<u64, Vec<LocListEntry>>,
    call_frames: Vec<CallFrame>,
}

impl SymbolDatabase
{
    /// Start collecting debug information.
    #[must_use]
    pub fn builder() -> DatabaseBuilder
    {
        DatabaseBuilder::new()
    }

    /// A database with no content.
    #[must_use]
    pub fn empty() -> Self
    {
        Self::default()
    }

    #[must_use]
    pub fn entry(&self, key: EntryKey) -> Option<&DebugInfoEntry>
    {
        self.entry_slots.get(&key).map(|&slot| &self.entries[slot])
    }

    /// Every entry in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &DebugInfoEntry>
    {
        self.entries.iter()
    }

    /// Children of `key` in insertion order; empty for unknown keys.
    pub fn children_of(&self, key: EntryKey) -> impl Iterator<Item = &DebugInfoEntry>
    {
        self.children
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&slot| &self.entries[slot])
    }

    /// Walk from `key` through outer scopes (inclusive) to the first entry
    /// tagged `tag`.
    #[must_use]
    pub fn nearest_scope_with_tag(&self, key: EntryKey, tag: gimli::DwTag) -> Option<&DebugInfoEntry>
    {
        let mut current = self.entry(key);
        while let Some(entry) = current {
            if entry.tag == tag {
                return Some(entry);
            }
            current = entry.outer_scope.and_then(|outer| self.entry(outer));
        }
        None
    }

    /// Scope owning `address`: the transition with the largest address at or
    /// below it.
    #[must_use]
    pub fn scope_for_address(&self, address: u64) -> Option<&DebugInfoEntry>
    {
        let slot = floor_slot(&self.scope_transitions, address, |transition| transition.address)?;
        self.scope_transitions[slot].entry.and_then(|key| self.entry(key))
    }

    /// Line row with the largest start address at or below `address`.
    ///
    /// The row does not necessarily cover `address`; callers check
    /// [`SourceLocation::contains`].
    #[must_use]
    pub fn location_for_address(&self, address: u64) -> Option<&SourceLocation>
    {
        floor_slot(&self.locations, address, |location| location.start).map(|slot| &self.locations[slot])
    }

    /// Call frame with the largest start address at or below `address`.
    #[must_use]
    pub fn call_frame_for_address(&self, address: u64) -> Option<&CallFrame>
    {
        floor_slot(&self.call_frames, address, |frame| frame.address).map(|slot| &self.call_frames[slot])
    }

    /// Range of `owner`'s range list that contains `address`.
    #[must_use]
    pub fn range_for_address(&self, address: u64, owner: EntryKey) -> Option<&RangeListEntry>
    {
        self.range_lists
            .get(&owner)?
            .iter()
            .find(|range| range.contains(address))
    }

    /// Whole range list owned by `owner`.
    #[must_use]
    pub fn range_list(&self, owner: EntryKey) -> &[RangeListEntry]
    {
        self.range_lists.get(&owner).map(Vec::as_slice).unwrap_or_default()
    }

    /// Location list at `offset`.
    #[must_use]
    pub fn loc_list(&self, offset: u64) -> Option<&[LocListEntry]>
    {
        self.loc_lists.get(&offset).map(Vec::as_slice)
    }

    pub fn files(&self) -> impl Iterator<Item = &SourceFile>
    {
        self.files.iter()
    }

    #[must_use]
    pub fn file(&self, key: FileKey) -> Option<&SourceFile>
    {
        self.file_slots.get(&key).map(|&slot| &self.files[slot])
    }

    /// Files whose last path component is exactly `basename`.
    pub fn files_by_name(&self, basename: &str) -> impl Iterator<Item = &SourceFile>
    {
        self.files_by_name
            .get(basename)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&slot| &self.files[slot])
    }

    /// Line rows of `file` in address order.
    pub fn locations_for_file(&self, file: FileKey) -> impl Iterator<Item = &SourceLocation>
    {
        self.locations_by_file
            .get(&file)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&slot| &self.locations[slot])
    }

    /// Line rows whose innermost scope is `scope`, sorted by line.
    pub fn locations_in_scope(&self, scope: EntryKey) -> impl Iterator<Item = &SourceLocation>
    {
        self.locations_by_scope
            .get(&scope)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&slot| &self.locations[slot])
    }

    /// Smallest line among the rows owned by `scope`.
    #[must_use]
    pub fn first_line_of_scope(&self, scope: EntryKey) -> Option<u32>
    {
        self.locations_in_scope(scope).next().map(|location| location.line)
    }

    /// Every line row in address order.
    #[must_use]
    pub fn locations(&self) -> &[SourceLocation]
    {
        &self.locations
    }

    #[must_use]
    pub fn call_frames(&self) -> &[CallFrame]
    {
        &self.call_frames
    }

    #[must_use]
    pub fn stats(&self) -> DatabaseStats
    {
        DatabaseStats {
            entries: self.entries.len(),
            files: self.files.len(),
            locations: self.locations.len(),
            scope_transitions: self.scope_transitions.len(),
            call_frames: self.call_frames.len(),
            loc_lists: self.loc_lists.len(),
            range_entries: self.range_lists.values().map(Vec::len).sum(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty() && self.locations.is_empty()
    }

    fn group_locations_by_scope(&self) -> HashMap<EntryKey, Vec<usize>>
    {
        let mut grouped: HashMap<EntryKey, Vec<usize>> = HashMap::new();
        for (slot, location) in self.locations.iter().enumerate() {
            if let Some(scope) = self.scope_for_address(location.start) {
                grouped.entry(scope.key).or_default().push(slot);
            }
        }
        for slots in grouped.values_mut() {
            slots.sort_by_key(|&slot| (self.locations[slot].line, self.locations[slot].start));
        }
        grouped
    }
}

/// Index of the last item whose key is `<= address` in a slice sorted by key.
fn floor_slot<T>(items: &[T], address: u64, key: impl Fn(&T) -> u64) -> Option<usize>
{
    items.partition_point(|item| key(item) <= address).checked_sub(1)
}
