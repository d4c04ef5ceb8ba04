//! Tests for the symbol database and its indices

mod support;

use nacldbg_core::symbols::{
    dwarf, DebugInfoEntry, EntryKey, FileKey, Rule, RuleKind, RuleRegister, SourceLocation, SymbolDatabase,
};
use nacldbg_core::DebuggerError;
use support::{hello_builder, hello_database, BLOCK, COUNT, CU, HELPER, MAIN};

#[test]
fn test_scope_for_address_follows_transitions()
{
    let database = hello_database();
    assert_eq!(database.scope_for_address(0x1000).map(|e| e.key), Some(MAIN));
    assert_eq!(database.scope_for_address(0x1025).map(|e| e.key), Some(BLOCK));
    assert_eq!(database.scope_for_address(0x1030).map(|e| e.key), Some(MAIN));
    assert_eq!(database.scope_for_address(0x105f).map(|e| e.key), Some(HELPER));
    assert!(database.scope_for_address(0x1060).is_none());
    assert!(database.scope_for_address(0x0fff).is_none());
}

#[test]
fn test_locations_in_scope_sorted_by_line()
{
    let database = hello_database();
    let lines: Vec<u32> = database.locations_in_scope(MAIN).map(|l| l.line).collect();
    assert_eq!(lines, vec![3, 4, 6, 10]);
    assert_eq!(database.first_line_of_scope(BLOCK), Some(8));
    assert_eq!(database.first_line_of_scope(HELPER), Some(14));
    assert_eq!(database.first_line_of_scope(CU), None);
}

#[test]
fn test_tree_navigation()
{
    let database = hello_database();
    let children: Vec<EntryKey> = database.children_of(MAIN).map(|e| e.key).collect();
    assert_eq!(children, vec![COUNT, BLOCK]);
    assert_eq!(
        database
            .nearest_scope_with_tag(BLOCK, dwarf::DW_TAG_subprogram)
            .map(|e| e.key),
        Some(MAIN)
    );
    assert!(database
        .nearest_scope_with_tag(MAIN, dwarf::DW_TAG_lexical_block)
        .is_none());
}

#[test]
fn test_file_and_frame_lookups()
{
    let database = hello_database();
    assert_eq!(database.files_by_name("hello.c").count(), 1);
    assert_eq!(database.files_by_name("other.c").count(), 0);
    assert_eq!(database.locations_for_file(support::FILE).count(), 7);
    assert_eq!(database.call_frame_for_address(0x1050).map(|f| f.address), Some(0x1040));
    assert_eq!(database.call_frame_for_address(0x1010).map(|f| f.address), Some(0x1000));
    assert!(database.call_frame_for_address(0x0fff).is_none());
}

#[test]
fn test_stats()
{
    let stats = hello_database().stats();
    assert_eq!(stats.entries, 7);
    assert_eq!(stats.files, 1);
    assert_eq!(stats.locations, 7);
    assert_eq!(stats.scope_transitions, 5);
    assert_eq!(stats.call_frames, 2);
}

#[test]
fn test_unknown_file_is_corrupt()
{
    let mut builder = hello_builder();
    builder.add_location(SourceLocation {
        start: 0x2000,
        length: 4,
        file: FileKey::new(99),
        line: 1,
        column: 0,
    });
    let err = builder.build_indices().unwrap_err();
    assert!(matches!(err, DebuggerError::CorruptDatabase(_)));
}

#[test]
fn test_rule_for_missing_frame_is_corrupt()
{
    let mut builder = SymbolDatabase::builder();
    builder.add_rule(
        0x500,
        Rule {
            address: 0x500,
            register: RuleRegister::Cfa,
            kind: RuleKind::SameValue,
        },
    );
    let err = builder.build_indices().unwrap_err();
    assert!(err.to_string().contains("never added"));
}

#[test]
fn test_index_failure_is_deterministic()
{
    let broken = || {
        let mut builder = hello_builder();
        builder.add_scope_transition(0x3000, Some(EntryKey::new(0xdead)));
        builder.add_scope_transition(0x2000, Some(EntryKey::new(0xbeef)));
        builder.add_entry(DebugInfoEntry::new(
            EntryKey::new(0x77),
            Some(EntryKey::new(0x78)),
            dwarf::DW_TAG_variable,
        ));
        builder.build_indices().unwrap_err().to_string()
    };
    let first = broken();
    for _ in 0..5 {
        assert_eq!(broken(), first);
    }
    assert!(first.contains("unknown parent"));
}
