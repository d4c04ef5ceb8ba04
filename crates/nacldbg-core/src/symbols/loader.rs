//! DWARF ingestion.
//!
//! Reads an object file with `object`, loads its DWARF sections with `gimli`
//! and feeds everything into a [`DatabaseBuilder`]:
//!
//! - every DIE with its attributes, parent and outer-scope link
//! - scope transitions from `low_pc`/`high_pc` and `DW_AT_ranges`
//! - location lists referenced by `DW_AT_location` and `DW_AT_frame_base`
//! - line programs as source files and line rows
//! - call frame information from `.debug_frame`, or `.eh_frame` when the
//!   module has no `.debug_frame`

use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use gimli::{
    constants, AttributeValue as DwarfValue, BaseAddresses, CfaRule, CieOrFde, DebugFrame, Dwarf, EhFrame,
    EndianArcSlice, EntriesTreeNode, Reader, RegisterRule, RunTimeEndian, SectionId, Unit, UnitOffset,
    UnitSectionOffset, UnwindContext, UnwindSection,
};
use object::{Object, ObjectSection};
use tracing::{debug, info, trace};

use super::database::{
    DatabaseBuilder, FileKey, LocListEntry, RangeListEntry, Rule, RuleKind, RuleRegister, SourceLocation,
    SymbolDatabase,
};
use super::entry::{AttributeValue, DebugInfoEntry, EntryKey};
use crate::error::{map_dwarf_error, DebuggerError, Result};

type OwnedReader = EndianArcSlice<RunTimeEndian>;
type OwnedDwarf = Dwarf<OwnedReader>;

/// Parse the module at `path` into an indexed database.
///
/// # Errors
///
/// [`DebuggerError::Io`] if the file cannot be read, [`DebuggerError::MalformedDwarf`]
/// if it is not an object file or its debug information does not parse, and
/// [`DebuggerError::CorruptDatabase`] if indexing rejects the result.
pub fn load_module(path: &Path) -> Result<SymbolDatabase>
{
    let bytes = fs::read(path)?;
    info!(path = %path.display(), size = bytes.len(), "loading module debug information");
    load_from_bytes(&bytes)
}

/// Parse an in-memory object file into an indexed database.
///
/// # Errors
///
/// See [`load_module`].
pub fn load_from_bytes(data: &[u8]) -> Result<SymbolDatabase>
{
    let file = object::File::parse(data)
        .map_err(|err| DebuggerError::MalformedDwarf(format!("parsing object file: {err}")))?;
    let endian = if file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let dwarf = Dwarf::load(|id| load_section(&file, id, endian))?;
    let units = collect_units(&dwarf)?;

    let mut builder = SymbolDatabase::builder();
    let mut ingest = DwarfIngest {
        dwarf: &dwarf,
        units: &units,
        builder: &mut builder,
    };
    for unit_index in 0..units.len() {
        ingest.entries(unit_index)?;
        ingest.line_program(unit_index)?;
    }
    load_call_frames(&file, endian, &mut builder)?;

    builder.build_indices()
}

fn section_bytes<'data>(section: &object::Section<'data, '_>, name: &str) -> Result<Cow<'data, [u8]>>
{
    section
        .uncompressed_data()
        .map_err(|err| DebuggerError::MalformedDwarf(format!("failed to read {name}: {err}")))
}

fn load_section(file: &object::File<'_>, id: SectionId, endian: RunTimeEndian) -> Result<OwnedReader>
{
    let data: Arc<[u8]> = match file.section_by_name(id.name()) {
        Some(section) => Arc::from(&*section_bytes(&section, id.name())?),
        None => Arc::from(Vec::new()),
    };
    Ok(EndianArcSlice::new(data, endian))
}

fn collect_units(dwarf: &OwnedDwarf) -> Result<Vec<Unit<OwnedReader>>>
{
    let mut units = Vec::new();
    let mut headers = dwarf.units();
    while let Some(header) = headers
        .next()
        .map_err(|err| map_dwarf_error("reading .debug_info unit header", err))?
    {
        units.push(
            dwarf
                .unit(header)
                .map_err(|err| map_dwarf_error("parsing compilation unit", err))?,
        );
    }
    debug!(units = units.len(), "parsed compilation units");
    Ok(units)
}

fn unit_index_u32(unit_index: usize) -> Result<u32>
{
    u32::try_from(unit_index)
        .map_err(|_| DebuggerError::MalformedDwarf(format!("too many compilation units ({unit_index})")))
}

fn entry_key(unit_index: usize, offset: UnitOffset<usize>) -> Result<EntryKey>
{
    let offset = u32::try_from(offset.0)
        .map_err(|_| DebuggerError::MalformedDwarf(format!("unit offset 0x{:x} out of range", offset.0)))?;
    Ok(EntryKey::from_parts(unit_index_u32(unit_index)?, offset))
}

struct DwarfIngest<'a>
{
    dwarf: &'a OwnedDwarf,
    units: &'a [Unit<OwnedReader>],
    builder: &'a mut DatabaseBuilder,
}

impl<'a> DwarfIngest<'a>
{
    fn entries(&mut self, unit_index: usize) -> Result<()>
    {
        let units = self.units;
        let unit = &units[unit_index];
        let mut tree = unit
            .entries_tree(None)
            .map_err(|err| map_dwarf_error("reading DIE tree", err))?;
        let root = tree.root().map_err(|err| map_dwarf_error("reading DIE tree root", err))?;
        self.entry_node(unit_index, unit, root, None, None)
    }

    fn entry_node(
        &mut self,
        unit_index: usize,
        unit: &Unit<OwnedReader>,
        node: EntriesTreeNode<'_, '_, '_, OwnedReader>,
        parent: Option<EntryKey>,
        outer_scope: Option<EntryKey>,
    ) -> Result<()>
    {
        let die = node.entry();
        let key = entry_key(unit_index, die.offset())?;
        let mut entry = DebugInfoEntry::new(key, parent, die.tag()).with_outer_scope(outer_scope);
        let mut high_pc_offset = None;

        let mut attrs = die.attrs();
        while let Some(attr) = attrs
            .next()
            .map_err(|err| map_dwarf_error("reading DIE attributes", err))?
        {
            match attr.name() {
                constants::DW_AT_high_pc => match attr.value() {
                    DwarfValue::Addr(address) => {
                        entry.set_attribute(constants::DW_AT_high_pc, AttributeValue::Unsigned(address));
                    }
                    DwarfValue::DebugAddrIndex(index) => {
                        let address = self
                            .dwarf
                            .address(unit, index)
                            .map_err(|err| map_dwarf_error("resolving DW_AT_high_pc", err))?;
                        entry.set_attribute(constants::DW_AT_high_pc, AttributeValue::Unsigned(address));
                    }
                    _ => high_pc_offset = attr.udata_value(),
                },
                constants::DW_AT_ranges => self.ranges(unit, key, outer_scope, attr.value())?,
                name => {
                    if let Some(value) = self.attribute_value(unit_index, unit, name, attr.value())? {
                        entry.set_attribute(name, value);
                    }
                }
            }
        }

        if let (Some(offset), Some(low)) = (high_pc_offset, entry.low_pc()) {
            entry.set_attribute(constants::DW_AT_high_pc, AttributeValue::Unsigned(low.wrapping_add(offset)));
        }

        if entry.is_scope() {
            self.scope_transitions(&entry);
        }
        let child_scope = if entry.is_scope() { Some(key) } else { outer_scope };
        self.builder.add_entry(entry);

        let mut children = node.children();
        while let Some(child) = children
            .next()
            .map_err(|err| map_dwarf_error("reading DIE children", err))?
        {
            self.entry_node(unit_index, unit, child, Some(key), child_scope)?;
        }
        Ok(())
    }

    /// A scope owns `[low_pc, high_pc)`. A child that starts where its parent
    /// starts replaces the parent's transition (children are visited after
    /// their parent); an end transition never replaces one already recorded,
    /// so a parent that ends where its child ends keeps the parent's end.
    fn scope_transitions(&mut self, entry: &DebugInfoEntry)
    {
        let (Some(low), Some(high)) = (entry.low_pc(), entry.high_pc()) else {
            return;
        };
        if high <= low {
            return;
        }
        self.scope_range(entry.key, entry.outer_scope, low, high);
    }

    fn scope_range(&mut self, key: EntryKey, outer_scope: Option<EntryKey>, low: u64, high: u64)
    {
        trace!(%key, low, high, "scope transition");
        self.builder.add_scope_transition(low, Some(key));
        if self.builder.scope_transition(high).is_none() {
            self.builder.add_scope_transition(high, outer_scope);
        }
    }

    fn ranges(
        &mut self,
        unit: &Unit<OwnedReader>,
        owner: EntryKey,
        outer_scope: Option<EntryKey>,
        value: DwarfValue<OwnedReader>,
    ) -> Result<()>
    {
        let Some(offset) = self
            .dwarf
            .attr_ranges_offset(unit, value)
            .map_err(|err| map_dwarf_error("reading DW_AT_ranges", err))?
        else {
            return Ok(());
        };

        let base = unit.low_pc;
        let mut ranges = self
            .dwarf
            .ranges(unit, offset)
            .map_err(|err| map_dwarf_error("reading range list", err))?;
        while let Some(range) = ranges
            .next()
            .map_err(|err| map_dwarf_error("reading range list entry", err))?
        {
            if range.end <= range.begin {
                continue;
            }
            let base = if range.begin >= base { base } else { 0 };
            self.builder.add_range_list_entry(RangeListEntry {
                owner,
                base,
                low: range.begin - base,
                high: range.end - base,
            });
            self.scope_range(owner, outer_scope, range.begin, range.end);
        }
        Ok(())
    }

    fn attribute_value(
        &mut self,
        unit_index: usize,
        unit: &Unit<OwnedReader>,
        name: gimli::DwAt,
        value: DwarfValue<OwnedReader>,
    ) -> Result<Option<AttributeValue>>
    {
        let converted = match value {
            DwarfValue::Addr(address) => AttributeValue::Unsigned(address),
            DwarfValue::DebugAddrIndex(index) => AttributeValue::Unsigned(
                self.dwarf
                    .address(unit, index)
                    .map_err(|err| map_dwarf_error("resolving address index", err))?,
            ),
            DwarfValue::Udata(value) | DwarfValue::Data8(value) => AttributeValue::Unsigned(value),
            DwarfValue::Data1(value) => AttributeValue::Unsigned(value.into()),
            DwarfValue::Data2(value) => AttributeValue::Unsigned(value.into()),
            DwarfValue::Data4(value) => AttributeValue::Unsigned(value.into()),
            DwarfValue::Sdata(value) => AttributeValue::Signed(value),
            DwarfValue::Flag(flag) => AttributeValue::Flag(flag),
            DwarfValue::Exprloc(expression) => AttributeValue::Bytes(owned_bytes(&expression.0)?),
            DwarfValue::Block(block) => AttributeValue::Bytes(owned_bytes(&block)?),
            DwarfValue::UnitRef(offset) => AttributeValue::Reference(entry_key(unit_index, offset)?),
            DwarfValue::DebugInfoRef(offset) => {
                let target = UnitSectionOffset::from(offset);
                let Some((target_index, target_offset)) = self
                    .units
                    .iter()
                    .enumerate()
                    .find_map(|(index, candidate)| target.to_unit_offset(candidate).map(|offset| (index, offset)))
                else {
                    trace!(?offset, "dropping reference outside every unit");
                    return Ok(None);
                };
                AttributeValue::Reference(entry_key(target_index, target_offset)?)
            }
            DwarfValue::String(_)
            | DwarfValue::DebugStrRef(_)
            | DwarfValue::DebugStrRefSup(_)
            | DwarfValue::DebugLineStrRef(_)
            | DwarfValue::DebugStrOffsetsIndex(_) => AttributeValue::String(self.string(unit, value)?),
            DwarfValue::SecOffset(_) | DwarfValue::LocationListsRef(_) | DwarfValue::DebugLocListsIndex(_)
                if matches!(name, constants::DW_AT_location | constants::DW_AT_frame_base) =>
            {
                let Some(offset) = self
                    .dwarf
                    .attr_locations_offset(unit, value)
                    .map_err(|err| map_dwarf_error("reading location list offset", err))?
                else {
                    return Ok(None);
                };
                self.loc_list(unit, offset)?;
                AttributeValue::LocationList(offset.0 as u64)
            }
            other => match other.udata_value() {
                Some(value) => AttributeValue::Unsigned(value),
                None => {
                    trace!(attribute = %name, "skipping attribute form");
                    return Ok(None);
                }
            },
        };
        Ok(Some(converted))
    }

    fn loc_list(&mut self, unit: &Unit<OwnedReader>, offset: gimli::LocationListsOffset<usize>) -> Result<()>
    {
        let key = offset.0 as u64;
        if self.builder.has_loc_list(key) {
            return Ok(());
        }
        let mut locations = self
            .dwarf
            .locations(unit, offset)
            .map_err(|err| map_dwarf_error("reading location list", err))?;
        while let Some(location) = locations
            .next()
            .map_err(|err| map_dwarf_error("reading location list entry", err))?
        {
            self.builder.add_loc_list_entry(
                key,
                LocListEntry {
                    start: location.range.begin,
                    end: location.range.end,
                    expression: owned_bytes(&location.data.0)?,
                },
            );
        }
        Ok(())
    }

    fn string(&self, unit: &Unit<OwnedReader>, value: DwarfValue<OwnedReader>) -> Result<String>
    {
        let reader = self
            .dwarf
            .attr_string(unit, value)
            .map_err(|err| map_dwarf_error("resolving DWARF string", err))?;
        let text = reader
            .to_string_lossy()
            .map_err(|err| map_dwarf_error("decoding DWARF string", err))?;
        Ok(text.into_owned())
    }

    fn line_program(&mut self, unit_index: usize) -> Result<()>
    {
        let units = self.units;
        let unit = &units[unit_index];
        let Some(program) = unit.line_program.clone() else {
            return Ok(());
        };
        let unit_id = unit_index_u32(unit_index)?;

        let header = program.header();
        let comp_dir = match &unit.comp_dir {
            Some(dir) => dir
                .to_string_lossy()
                .map_err(|err| map_dwarf_error("decoding DW_AT_comp_dir", err))?
                .into_owned(),
            None => String::new(),
        };
        let first_index = if header.version() >= 5 { 0 } else { 1 };
        let mut known_files = HashSet::new();
        for (position, file) in header.file_names().iter().enumerate() {
            let index = u32::try_from(position + first_index)
                .map_err(|_| DebuggerError::MalformedDwarf("line table has too many files".into()))?;
            let name = self.string(unit, file.path_name())?;
            let directory = match file.directory(header) {
                Some(dir) => {
                    let dir = self.string(unit, dir)?;
                    if Path::new(&dir).is_absolute() || comp_dir.is_empty() {
                        dir
                    } else {
                        Path::new(&comp_dir).join(dir).to_string_lossy().into_owned()
                    }
                }
                None => comp_dir.clone(),
            };
            let key = FileKey::from_parts(unit_id, index);
            self.builder.add_file(key, name, directory);
            known_files.insert(key);
        }

        let mut rows = program.rows();
        let mut spans = RowSpans::default();
        while let Some((_, row)) = rows
            .next_row()
            .map_err(|err| map_dwarf_error("running line program", err))?
        {
            let line = row.line().map_or(0, |line| u32::try_from(line.get()).unwrap_or(u32::MAX));
            let file = u32::try_from(row.file_index())
                .map(|index| FileKey::from_parts(unit_id, index))
                .ok()
                .filter(|key| known_files.contains(key));
            let column = match row.column() {
                gimli::ColumnType::LeftEdge => 0,
                gimli::ColumnType::Column(column) => u32::try_from(column.get()).unwrap_or(u32::MAX),
            };
            let next = match (file, row.end_sequence()) {
                (Some(file), false) if line != 0 => Some(SourceLocation {
                    start: row.address(),
                    length: 0,
                    file,
                    line,
                    column,
                }),
                _ => None,
            };
            if let Some(location) = spans.push(row.address(), next, row.end_sequence()) {
                self.builder.add_location(location);
            }
        }
        Ok(())
    }
}

/// Line rows become locations one row late, once the next row's address
/// gives them a length.
#[derive(Debug, Default)]
struct RowSpans
{
    pending: Option<SourceLocation>,
}

impl RowSpans
{
    /// Feed the row at `address`. `next` is `None` for an end of sequence or
    /// a row without a usable file and line. A row at the same address as
    /// the pending one is ignored, so the first row at an address wins.
    fn push(&mut self, address: u64, next: Option<SourceLocation>, end_sequence: bool) -> Option<SourceLocation>
    {
        match self.pending.take() {
            Some(location) if address == location.start && !end_sequence => {
                trace!(address, line = location.line, "ignoring row at an already started address");
                self.pending = Some(location);
                None
            }
            Some(mut location) => {
                self.pending = next;
                (address > location.start).then(|| {
                    location.length = address - location.start;
                    location
                })
            }
            None => {
                self.pending = next;
                None
            }
        }
    }
}

fn owned_bytes(reader: &OwnedReader) -> Result<Vec<u8>>
{
    reader
        .to_slice()
        .map(Cow::into_owned)
        .map_err(|err| map_dwarf_error("reading attribute block", err))
}

fn load_call_frames(file: &object::File<'_>, endian: RunTimeEndian, builder: &mut DatabaseBuilder) -> Result<()>
{
    let address_size = if file.is_64() { 8 } else { 4 };

    if let Some(section) = file.section_by_name(".debug_frame") {
        let data = section_bytes(&section, ".debug_frame")?;
        let mut debug_frame = DebugFrame::new(&data[..], endian);
        debug_frame.set_address_size(address_size);
        return call_frames(&debug_frame, &BaseAddresses::default(), builder);
    }

    if let Some(section) = file.section_by_name(".eh_frame") {
        let data = section_bytes(&section, ".eh_frame")?;
        let mut eh_frame = EhFrame::new(&data[..], endian);
        eh_frame.set_address_size(address_size);
        let mut bases = BaseAddresses::default().set_eh_frame(section.address());
        if let Some(text) = file.section_by_name(".text") {
            bases = bases.set_text(text.address());
        }
        if let Some(got) = file.section_by_name(".got") {
            bases = bases.set_got(got.address());
        }
        return call_frames(&eh_frame, &bases, builder);
    }

    debug!("module has no call frame information");
    Ok(())
}

fn call_frames<R, Section>(section: &Section, bases: &BaseAddresses, builder: &mut DatabaseBuilder) -> Result<()>
where
    R: Reader<Offset = usize>,
    Section: UnwindSection<R>,
{
    let mut entries = section.entries(bases);
    let mut ctx = UnwindContext::<usize>::new();
    let mut frames = 0usize;
    while let Some(entry) = entries
        .next()
        .map_err(|err| map_dwarf_error("reading unwind entry", err))?
    {
        let CieOrFde::Fde(partial) = entry else {
            continue;
        };
        let fde = partial
            .parse(|unwind_section, base_addresses, cie_offset| {
                unwind_section.cie_from_offset(base_addresses, cie_offset)
            })
            .map_err(|err| map_dwarf_error("parsing frame description entry", err))?;

        let start = fde.initial_address();
        builder.add_call_frame(start);
        frames += 1;

        let mut table = fde
            .rows(section, bases, &mut ctx)
            .map_err(|err| map_dwarf_error("evaluating call frame instructions", err))?;
        let mut previous: BTreeSet<u16> = BTreeSet::new();
        while let Some(row) = table
            .next_row()
            .map_err(|err| map_dwarf_error("evaluating unwind row", err))?
        {
            let address = row.start_address();
            builder.add_rule(
                start,
                Rule {
                    address,
                    register: RuleRegister::Cfa,
                    kind: cfa_kind(row.cfa()),
                },
            );

            let mut current = BTreeSet::new();
            for (register, rule) in row.registers() {
                current.insert(register.0);
                builder.add_rule(
                    start,
                    Rule {
                        address,
                        register: RuleRegister::Dwarf(register.0),
                        kind: register_kind(rule),
                    },
                );
            }
            // A register restored by this row no longer has a rule of its own.
            for &register in previous.difference(&current) {
                builder.add_rule(
                    start,
                    Rule {
                        address,
                        register: RuleRegister::Dwarf(register),
                        kind: RuleKind::SameValue,
                    },
                );
            }
            previous = current;
        }
    }
    debug!(frames, "ingested call frame information");
    Ok(())
}

fn cfa_kind(rule: &CfaRule<usize>) -> RuleKind
{
    match rule {
        CfaRule::RegisterAndOffset { register, offset } => RuleKind::ValOffset {
            base: RuleRegister::Dwarf(register.0),
            offset: *offset,
        },
        CfaRule::Expression(_) => RuleKind::ValExpression,
    }
}

fn register_kind(rule: &RegisterRule<usize>) -> RuleKind
{
    match rule {
        RegisterRule::Undefined => RuleKind::Undefined,
        RegisterRule::SameValue => RuleKind::SameValue,
        RegisterRule::Offset(offset) => RuleKind::Offset {
            base: RuleRegister::Cfa,
            offset: *offset,
        },
        RegisterRule::ValOffset(offset) => RuleKind::ValOffset {
            base: RuleRegister::Cfa,
            offset: *offset,
        },
        RegisterRule::Register(register) => RuleKind::Register {
            base: RuleRegister::Dwarf(register.0),
        },
        RegisterRule::Expression(_) => RuleKind::Expression,
        RegisterRule::ValExpression(_) => RuleKind::ValExpression,
        other => {
            trace!(?other, "treating unsupported register rule as undefined");
            RuleKind::Undefined
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn row(start: u64, line: u32) -> Option<SourceLocation>
    {
        Some(SourceLocation {
            start,
            length: 0,
            file: FileKey::from_parts(0, 1),
            line,
            column: 0,
        })
    }

    #[test]
    fn test_first_row_at_an_address_wins()
    {
        let mut spans = RowSpans::default();
        assert_eq!(spans.push(0x10, row(0x10, 3), false), None);
        assert_eq!(spans.push(0x10, row(0x10, 9), false), None);

        let first = spans.push(0x14, row(0x14, 4), false).unwrap();
        assert_eq!((first.start, first.length, first.line), (0x10, 4, 3));

        let second = spans.push(0x20, None, true).unwrap();
        assert_eq!((second.start, second.length, second.line), (0x14, 0xc, 4));
        assert_eq!(spans.push(0x30, row(0x30, 7), false), None);
    }

    #[test]
    fn test_empty_sequence_end_drops_row()
    {
        let mut spans = RowSpans::default();
        assert_eq!(spans.push(0x10, row(0x10, 3), false), None);
        assert_eq!(spans.push(0x10, None, true), None);
        assert_eq!(spans.push(0x20, row(0x20, 5), false), None);
    }
}
