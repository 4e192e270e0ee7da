//! Wiring of the three allocators: init order, the temp fallback to the
//! zone, string duplication, and one smoke pass over the process-wide
//! surface.

use tagheap::api::{self, MemorySystem};
use tagheap::{MemoryError, Options, Preference, Tag, ZoneKind};

fn small_options() -> Options {
    Options {
        zone_megs: 1,
        hunk_megs: 48,
    }
}

#[test]
fn temp_requests_fall_back_to_the_zone_before_hunk_init() {
    let mut memory = MemorySystem::new(&small_options());
    assert!(!memory.hunk_initialized());
    assert_eq!(memory.hunk_memory_remaining(), 0);
    assert!(!memory.hunk_check_mark());

    // the fallback serves zone memory, zero-filled like z_malloc
    let ptr = memory.hunk_allocate_temp(600).unwrap();
    for off in 0..600usize {
        assert_eq!(unsafe { (ptr + off).load::<u8>() }, 0);
    }
    assert_ne!(memory.zone_stats(ZoneKind::Main).tag_bytes[Tag::General], 0);

    // and the matching free routes back into the zone
    memory.hunk_free_temp(ptr).unwrap();
    assert_eq!(memory.zone_stats(ZoneKind::Main).tag_bytes[Tag::General], 0);
}

#[test]
fn hunk_comes_up_after_the_zones() {
    let mut memory = MemorySystem::new(&small_options());
    memory.init_hunk(&small_options());
    assert!(memory.hunk_initialized());
    assert_eq!(memory.hunk_memory_remaining(), 48 << 20);

    let ptr = memory.hunk_alloc(1000, Preference::Low).unwrap();
    assert_eq!(unsafe { ptr.load::<u8>() }, 0);
    assert_eq!(memory.hunk_memory_remaining(), (48 << 20) - 1024);

    let t = memory.hunk_allocate_temp(100).unwrap();
    memory.hunk_free_temp(t).unwrap();
    memory.hunk_set_mark();
    assert!(memory.hunk_check_mark());
    memory.hunk_clear_to_mark();
    memory.hunk_clear();
    assert!(!memory.hunk_check_mark());
    assert_eq!(memory.hunk_memory_remaining(), 48 << 20);
}

#[test]
#[should_panic(expected = "not initialized")]
fn permanent_hunk_alloc_before_init_is_fatal() {
    let mut memory = MemorySystem::new(&small_options());
    let _ = memory.hunk_alloc(64, Preference::Low);
}

#[test]
fn tag_routing_reaches_the_right_zone() {
    let mut memory = MemorySystem::new(&small_options());
    let small = memory.small_malloc(100).unwrap();
    let general = memory.tag_malloc(100, Tag::General).unwrap();

    assert_ne!(memory.zone_stats(ZoneKind::Small).tag_bytes[Tag::Small], 0);
    assert_ne!(memory.zone_stats(ZoneKind::Main).tag_bytes[Tag::General], 0);

    // free routes by the tag stored in the header, not by the caller
    memory.free(small).unwrap();
    memory.free(general).unwrap();
    assert_eq!(memory.zone_stats(ZoneKind::Small).used, 0);
    assert_eq!(memory.zone_stats(ZoneKind::Main).used, 0);
}

#[test]
fn copy_string_serves_singletons_and_the_small_zone() {
    let mut memory = MemorySystem::new(&small_options());

    let empty = memory.copy_string("").unwrap();
    let seven_a = memory.copy_string("7").unwrap();
    let seven_b = memory.copy_string("7").unwrap();
    assert_eq!(seven_a, seven_b, "singletons are shared");
    assert_eq!(unsafe { seven_a.load::<u8>() }, b'7');
    assert_eq!(memory.zone_stats(ZoneKind::Small).used, 0);

    // freeing a singleton is a no-op, any number of times
    memory.free(empty).unwrap();
    memory.free(seven_a).unwrap();
    memory.free(seven_a).unwrap();

    let hello = memory.copy_string("hello").unwrap();
    for (i, byte) in b"hello\0".iter().enumerate() {
        assert_eq!(unsafe { (hello + i).load::<u8>() }, *byte);
    }
    assert_ne!(memory.zone_stats(ZoneKind::Small).used, 0);
    memory.free(hello).unwrap();
    assert_eq!(memory.zone_stats(ZoneKind::Small).used, 0);
}

#[test]
fn null_free_surfaces_and_nothing_changes() {
    let mut memory = MemorySystem::new(&small_options());
    assert_eq!(
        memory.free(tagheap::Address::ZERO),
        Err(MemoryError::NullPointer)
    );
    memory.check_heap();
}

#[test]
fn global_surface_smoke() {
    api::init();
    api::init(); // idempotent

    let a = api::z_malloc(123).unwrap();
    for off in 0..123usize {
        assert_eq!(unsafe { (a + off).load::<u8>() }, 0);
    }
    let b = api::z_tag_malloc(64, Tag::Renderer).unwrap();
    let s = api::s_malloc(32).unwrap();
    let c = api::copy_string("list of maps").unwrap();

    assert_eq!(api::z_available_memory(), 1 << 30);
    assert!(api::zone_stats(ZoneKind::Main).tag_bytes[Tag::Renderer] > 0);

    api::z_free(a).unwrap();
    assert_eq!(api::z_free_tags(Tag::Renderer), 1);
    let _ = b; // swept by the tag free above
    api::z_free(s).unwrap();
    api::z_free(c).unwrap();

    let h = api::hunk_alloc(4096, Preference::DontCare).unwrap();
    assert_eq!(unsafe { h.load::<u8>() }, 0);
    let t = api::hunk_allocate_temp(512).unwrap();
    api::hunk_free_temp(t).unwrap();
    api::hunk_set_mark();
    assert!(api::hunk_check_mark());
    api::hunk_clear_to_mark();
    api::hunk_clear_temp();
    assert!(api::hunk_memory_remaining() > 0);
    api::hunk_clear();
}
