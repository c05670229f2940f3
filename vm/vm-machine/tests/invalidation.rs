//! Cross-thread TLB invalidation and shared address-space behavior.

use std::sync::{Arc, Barrier};
use std::thread;
use vm_machine::{Machine, System};
use vm_memory_addresses::{FRAME_SIZE, VirtualAddress};
use vm_paging::PageEntry;
use vm_pool::PoolConfig;

fn system() -> Arc<System> {
    Arc::new(System::new(PoolConfig {
        initial_capacity: 64 * 1024,
        max_capacity: 4096 * FRAME_SIZE,
    }))
}

fn va(addr: i64) -> VirtualAddress {
    VirtualAddress::new(addr)
}

#[test]
fn peer_mutation_invalidates_cached_translations() {
    let system = system();
    let mut b = Machine::new(Arc::clone(&system));
    let page = va(0x4000);
    system
        .reserve_virtual(page, FRAME_SIZE, PageEntry::reservation())
        .unwrap();

    // Warm B's TLB with a committed translation.
    b.copy_to_user(page, &[7]).unwrap();
    assert!(b.lookup_address(page).is_some());

    // Another thread (acting as machine A) tears the mapping down.
    let freeing_system = Arc::clone(&system);
    thread::spawn(move || {
        freeing_system.free_virtual(page, FRAME_SIZE).unwrap();
    })
    .join()
    .unwrap();

    // B's next lookup must not serve the stale TLB entry.
    let handle = thread::spawn(move || b.lookup_address(page).is_none());
    assert!(handle.join().unwrap());
}

#[test]
fn machines_share_one_address_space() {
    let system = system();
    let mut a = Machine::new(Arc::clone(&system));
    let mut b = Machine::new(Arc::clone(&system));
    system
        .reserve_virtual(va(0x6000), FRAME_SIZE, PageEntry::reservation())
        .unwrap();

    a.copy_to_user(va(0x6000), b"from a").unwrap();
    let mut out = [0u8; 6];
    b.copy_from_user(va(0x6000), &mut out).unwrap();
    assert_eq!(&out, b"from a");
}

#[test]
fn concurrent_commits_land_in_one_tree() {
    let pages = 32u64;
    let base = 0x10_0000i64;
    // Backed generously up front: growth relocates the pool base, which
    // is only legal while peers hold no pool pointers.
    let system = Arc::new(System::new(PoolConfig {
        initial_capacity: 256 * FRAME_SIZE,
        max_capacity: 4096 * FRAME_SIZE,
    }));
    system
        .reserve_virtual(va(base), pages * FRAME_SIZE, PageEntry::reservation())
        .unwrap();

    let start = Arc::new(Barrier::new(2));
    let mut workers = Vec::new();
    for parity in 0..2u64 {
        let mut m = Machine::new(Arc::clone(&system));
        let start = Arc::clone(&start);
        workers.push(thread::spawn(move || {
            start.wait();
            for n in (parity..pages).step_by(2) {
                let addr = va(base + (n * FRAME_SIZE) as i64);
                m.copy_to_user(addr, &[n as u8]).unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(system.stats().committed, pages);

    // Every page carries the byte its committer wrote.
    let mut checker = Machine::new(Arc::clone(&system));
    for n in 0..pages {
        let mut out = [0u8; 1];
        checker
            .copy_from_user(va(base + (n * FRAME_SIZE) as i64), &mut out)
            .unwrap();
        assert_eq!(out[0], n as u8);
    }
}
