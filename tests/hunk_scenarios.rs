//! Hunk allocator scenarios exercised through the public surface.

use tagheap::util::constants::CACHELINE_BYTES;
use tagheap::{Hunk, MemoryError, Preference};

const MBYTE: usize = 1 << 20;

#[test]
fn side_swap_after_temp_traffic() {
    // permanent allocations on low, a mark, temp traffic,
    // then a dontcare allocation lands on the side with the greater
    // touched-but-unused space (the high side)
    let mut hunk = Hunk::new(MBYTE);

    for _ in 0..5 {
        hunk.alloc(100, Preference::Low).unwrap();
    }
    assert!(hunk.permanent_is_low());
    assert_eq!(hunk.low_bank().permanent, 5 * 128);

    hunk.set_mark();
    assert!(hunk.check_mark());

    let t1 = hunk.allocate_temp(200).unwrap();
    let t2 = hunk.allocate_temp(200).unwrap();
    let t3 = hunk.allocate_temp(200).unwrap();
    // temp lives on the high side, and no swap may happen while it does
    assert!(hunk.permanent_is_low());
    assert!(hunk.high_bank().temp_highwater > 0);

    hunk.free_temp(t3);
    hunk.free_temp(t2);
    hunk.free_temp(t1);

    let p = hunk.alloc(100, Preference::DontCare).unwrap();
    assert!(
        !hunk.permanent_is_low(),
        "permanent allocations move to the touched high side"
    );
    assert_eq!(p, hunk.base() + hunk.total() - 128usize);

    // the low bank kept everything it held at the mark
    assert_eq!(hunk.low_bank().permanent, 5 * 128);
    assert_eq!(hunk.low_bank().mark, 5 * 128);
}

#[test]
fn temp_lifo_reclamation() {
    // out-of-order temp frees reclaim nothing until the top
    // is freed or the temp side is bulk-cleared
    let mut hunk = Hunk::new(MBYTE);
    let t1 = hunk.allocate_temp(100).unwrap();
    let t2 = hunk.allocate_temp(200).unwrap();
    let t3 = hunk.allocate_temp(300).unwrap();
    let full = hunk.high_bank().temp;

    hunk.free_temp(t2);
    assert_eq!(hunk.high_bank().temp, full, "out-of-order free reclaims nothing");

    let t3_size = 304 + 8;
    hunk.free_temp(t3);
    assert_eq!(hunk.high_bank().temp, full - t3_size, "top free retracts");

    hunk.free_temp(t1);
    assert_eq!(
        hunk.high_bank().temp,
        full - t3_size,
        "T1 is not the top while T2's bytes still stand"
    );

    hunk.clear_temp();
    assert_eq!(hunk.high_bank().temp, hunk.high_bank().permanent);
    assert_eq!(hunk.high_bank().temp_highwater, full);
}

#[test]
fn zero_fill_and_cacheline_alignment() {
    let mut hunk = Hunk::new(MBYTE);
    for size in [1usize, 64, 100, 1000] {
        let ptr = hunk.alloc(size, Preference::DontCare).unwrap();
        assert!(ptr.is_aligned_to(CACHELINE_BYTES));
        for off in 0..size {
            assert_eq!(unsafe { (ptr + off).load::<u8>() }, 0);
        }
        // dirty the memory so a later zero-fill failure would show
        for off in 0..size {
            unsafe { (ptr + off).store(0xffu8) };
        }
    }
}

#[test]
fn permanent_allocations_from_both_ends_never_overlap() {
    let mut hunk = Hunk::new(MBYTE);
    let mut ranges: Vec<(usize, usize)> = Vec::new();

    // force traffic onto both sides by seeding high-side slack
    let t = hunk.allocate_temp(4096).unwrap();
    hunk.free_temp(t);

    let mut flip = false;
    for _ in 0..32 {
        let pref = if flip { Preference::Low } else { Preference::High };
        flip = !flip;
        let ptr = hunk.alloc(512, pref).unwrap();
        ranges.push((ptr.as_usize(), 512));
    }
    for (i, &(start_a, len_a)) in ranges.iter().enumerate() {
        for &(start_b, len_b) in &ranges[i + 1..] {
            let disjoint = start_a + len_a <= start_b || start_b + len_b <= start_a;
            assert!(disjoint, "hunk allocations overlap");
        }
    }
}

#[test]
fn capacity_exhaustion_is_recoverable_and_harmless() {
    let mut hunk = Hunk::new(64 * 1024);
    hunk.alloc(32 * 1024, Preference::Low).unwrap();
    let before_low = hunk.low_bank();
    let before_high = hunk.high_bank();

    let err = hunk.alloc(48 * 1024, Preference::DontCare);
    assert!(matches!(err, Err(MemoryError::HunkExhausted { size: _ })));
    assert_eq!(hunk.low_bank(), before_low);
    assert_eq!(hunk.high_bank(), before_high);

    let err = hunk.allocate_temp(64 * 1024);
    assert!(matches!(err, Err(MemoryError::HunkTempExhausted { size: _ })));
    assert_eq!(hunk.low_bank(), before_low);
    assert_eq!(hunk.high_bank(), before_high);

    // a fitting request still succeeds afterwards
    hunk.alloc(16 * 1024, Preference::Low).unwrap();
}

#[test]
fn mark_round_trip() {
    let mut hunk = Hunk::new(MBYTE);
    hunk.alloc(1000, Preference::Low).unwrap();
    hunk.set_mark();
    let low = hunk.low_bank();
    let high = hunk.high_bank();

    for _ in 0..8 {
        hunk.alloc(2048, Preference::DontCare).unwrap();
    }
    hunk.clear_to_mark();

    assert_eq!(hunk.low_bank().permanent, low.permanent);
    assert_eq!(hunk.low_bank().temp, low.permanent);
    assert_eq!(hunk.high_bank().permanent, high.permanent);
    assert_eq!(hunk.high_bank().temp, high.permanent);
    assert_eq!(hunk.memory_remaining(), MBYTE - low.permanent - high.permanent);
}

#[test]
fn clear_restores_boot_state() {
    let mut hunk = Hunk::new(MBYTE);
    hunk.alloc(4096, Preference::Low).unwrap();
    let t = hunk.allocate_temp(512).unwrap();
    hunk.free_temp(t);
    hunk.set_mark();

    hunk.clear();
    assert!(hunk.permanent_is_low());
    assert!(!hunk.check_mark());
    assert_eq!(hunk.memory_remaining(), MBYTE);
    assert_eq!(hunk.low_bank().temp_highwater, 0);
    assert_eq!(hunk.high_bank().temp_highwater, 0);
}
