/*!
 * Lifecycle Tests
 * Runtime hooks, policy-driven merging, and finalization
 *
 * One sequential test: the phases share a process-global layer and
 * finalization is irreversible, so their order is part of the scenario.
 */

use pagemerge::{Config, MergeMode, PageState};
use pretty_assertions::assert_eq;
use std::sync::OnceLock;

static TEMPDIR: OnceLock<tempfile::TempDir> = OnceLock::new();

fn stats_dir() -> &'static std::path::Path {
    TEMPDIR.get_or_init(|| tempfile::tempdir().unwrap()).path()
}

fn write_byte(addr: usize, offset: usize, value: u8) {
    unsafe { std::ptr::write_volatile((addr + offset) as *mut u8, value) }
}

#[test]
fn test_lifecycle_from_init_to_finalize() {
    // --- before init, there is no layer ---
    assert!(pagemerge::get().is_none());

    let config = Config {
        merge_mode: MergeMode::AllocFrequency,
        // fire a full pass every other allocation
        merge_frequency: 2,
        standalone: true,
        sem_key: std::process::id(),
        stats_dir: stats_dir().to_path_buf(),
        ..Config::default()
    };
    let layer = pagemerge::init(config.clone()).unwrap();
    let ps = layer.page_size();
    assert!(std::ptr::eq(pagemerge::get().unwrap(), layer));

    // --- init is idempotent for the process ---
    let again = pagemerge::init(config).unwrap();
    assert!(std::ptr::eq(again, layer));

    // --- the frequency policy merges without being asked ---
    let addr = layer.alloc(ps).unwrap();
    write_byte(addr, 0, 0xee);
    assert_eq!(layer.page_state(addr), Some(PageState::Private));

    // every second allocation runs a pass; two dummy allocations
    // guarantee one fires regardless of the counter's parity
    let a = layer.alloc(ps).unwrap();
    let b = layer.alloc(ps).unwrap();
    assert_eq!(layer.page_state(addr), Some(PageState::Shared));

    layer.free(addr).unwrap();
    layer.free(a).unwrap();
    layer.free(b).unwrap();

    // --- finalize stops allocation and flushes statistics ---
    pagemerge::runtime_finalize();
    assert!(layer.alloc(ps).is_none());

    let rank = layer.rank();
    let entries: Vec<_> = std::fs::read_dir(stats_dir())
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_name().to_string_lossy().starts_with("memusage."))
        .collect();
    assert_eq!(entries.len(), 1, "one statistics file per sibling");
    let name = entries[0].file_name().to_string_lossy().to_string();
    assert!(name.ends_with(&format!(".{rank}")), "{name}");

    let contents = std::fs::read_to_string(entries[0].path()).unwrap();
    assert!(!contents.is_empty());
    for line in contents.lines() {
        assert_eq!(line.split(' ').count(), 6, "six counters per line: {line}");
        for field in line.split(' ') {
            field.parse::<i64>().unwrap();
        }
    }
}
