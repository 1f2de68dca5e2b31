/*!
 * Runtime-Gate Tests
 * Without the runtime init hook or declared standalone mode, the
 * allocation surface refuses to operate and callers fall through to the
 * small-object allocator
 */

use pagemerge::{Config, MergeMode};
use pretty_assertions::assert_eq;

#[test]
fn test_allocation_surface_waits_for_the_runtime_hook() {
    let dir = tempfile::tempdir().unwrap();
    let key = std::process::id();
    let layer = pagemerge::init(Config {
        merge_mode: MergeMode::AllocFrequency,
        merge_frequency: u64::MAX,
        standalone: false,
        sem_key: key,
        stats_dir: dir.path().to_path_buf(),
        ..Config::default()
    })
    .unwrap();
    let ps = layer.page_size();

    // joined, but the runtime hook has not fired: every entry point
    // returns its fall-through sentinel
    assert!(layer.alloc(ps).is_none());
    assert!(layer.realloc(0x1000, ps).is_none());
    assert_eq!(layer.size_of(0x1000), 0);
    assert!(layer.free(0x1000).is_err());

    // the runtime hook attaches the already-initialized layer and opens
    // the surface
    std::env::set_var("SEM_KEY", key.to_string());
    let attached = pagemerge::runtime_init().unwrap();
    assert!(std::ptr::eq(attached, layer));
    std::env::remove_var("SEM_KEY");

    let addr = layer.alloc(ps).unwrap();
    unsafe { std::ptr::write_volatile(addr as *mut u8, 5) };
    assert_eq!(unsafe { std::ptr::read_volatile(addr as *const u8) }, 5);
    assert_eq!(layer.size_of(addr), ps);
    layer.free(addr).unwrap();
}
