mod common;

use common::{ElfBuilder, FRESH_FILL, FakeMemory, Op, PF_R, PF_W, PF_X, PT_NOTE, SPACE};
use kernel_exec::{
    ElfError, LoadError, LoadPlan, PageAccess, SegmentLoader, UserLayout, VirtualAddress,
    load_image,
};

fn rx() -> PageAccess {
    PageAccess::new()
        .with_read(true)
        .with_execute(true)
        .with_user(true)
}

fn rw() -> PageAccess {
    PageAccess::user_data()
}

fn rwx() -> PageAccess {
    rw().with_execute(true)
}

#[test]
fn non_load_segments_are_never_touched() {
    let image = ElfBuilder::new(0x1000)
        .segment(PT_NOTE, PF_R, 0x5000, b"note", 4)
        .load(PF_R | PF_X, 0x1000, &[0xC3], 1)
        .build();

    let mut vm = FakeMemory::new();
    load_image(&mut vm, SPACE, &image).unwrap();

    assert_eq!(vm.mapped(), vec![0x1000]);
    assert!(vm.ops.iter().all(|op| !matches!(op, Op::Write(0x5000, _))));
}

#[test]
fn zero_sized_segments_are_skipped() {
    let image = ElfBuilder::new(0x1000)
        .load(PF_R | PF_X, 0x1000, &[0xC3], 1)
        .load(PF_R | PF_W, 0x9000, &[], 0)
        .build();

    let mut vm = FakeMemory::new();
    load_image(&mut vm, SPACE, &image).unwrap();

    assert_eq!(vm.mapped(), vec![0x1000]);
}

#[test]
fn mapping_covers_the_trailing_partial_page() {
    let image = ElfBuilder::new(0x1ff0)
        .load(PF_R | PF_X, 0x1ff0, &[0xAB; 0x20], 0x20)
        .build();

    let mut vm = FakeMemory::new();
    load_image(&mut vm, SPACE, &image).unwrap();

    assert_eq!(vm.mapped(), vec![0x1000, 0x2000]);
    assert_eq!(vm.read(0x1ff0, 0x20), vec![0xAB; 0x20]);
}

#[test]
fn file_bytes_are_copied_and_the_tail_is_zeroed() {
    let data: Vec<u8> = (1..=100).collect();
    let image = ElfBuilder::new(0x40_0000)
        .load(PF_R | PF_W, 0x40_0010, &data, 0x2000)
        .build();

    let mut vm = FakeMemory::new();
    load_image(&mut vm, SPACE, &image).unwrap();

    assert_eq!(vm.read(0x40_0010, 100), data);
    assert!(vm.read(0x40_0010 + 100, 0x2000 - 100).iter().all(|&b| b == 0));
    // Bytes outside [vaddr, vaddr + memsz) keep whatever the frame held.
    assert_eq!(vm.read(0x40_0000, 0x10), vec![FRESH_FILL; 0x10]);
}

#[test]
fn pages_are_writable_during_copy_and_protected_afterwards() {
    let image = ElfBuilder::new(0x40_0000)
        .load(PF_R | PF_X, 0x40_0000, &[0x90; 0x1800], 0x1800)
        .build();

    let mut vm = FakeMemory::new();
    load_image(&mut vm, SPACE, &image).unwrap();

    assert_eq!(
        vm.ops,
        vec![
            Op::Map(0x40_0000, rw()),
            Op::Map(0x40_1000, rw()),
            Op::Write(0x40_0000, 0x1800),
            Op::Protect(0x40_0000, rx()),
            Op::Protect(0x40_1000, rx()),
        ]
    );
    assert_eq!(vm.access(0x40_0000), Some(rx()));
    assert_eq!(vm.access(0x40_1000), Some(rx()));
}

#[test]
fn entry_is_returned_verbatim() {
    let image = ElfBuilder::new(0x40_0123)
        .load(PF_R | PF_X, 0x40_0000, &[0x90; 0x200], 0x200)
        .build();

    let mut vm = FakeMemory::new();
    let entry = load_image(&mut vm, SPACE, &image).unwrap();
    assert_eq!(entry, VirtualAddress::new(0x40_0123));
}

#[test]
fn code_and_bss_segments() {
    let text: Vec<u8> = (0..0x10).collect();
    let image = ElfBuilder::new(0x1000)
        .load(PF_R | PF_X, 0x1000, &text, 0x10)
        .load(PF_R | PF_W, 0x2000, b"ABCDEFGH", 0x1000)
        .build();

    let mut vm = FakeMemory::new();
    load_image(&mut vm, SPACE, &image).unwrap();

    assert_eq!(vm.mapped(), vec![0x1000, 0x2000]);

    let a = vm.access(0x1000).unwrap();
    assert!(!a.write() && a.execute() && a.read() && a.user());
    let b = vm.access(0x2000).unwrap();
    assert!(b.write() && !b.execute() && b.read() && b.user());

    assert_eq!(vm.read(0x1000, 0x10), text);
    assert_eq!(vm.read(0x2000, 8), b"ABCDEFGH");
    assert_eq!(vm.read(0x2008, 4088), vec![0; 4088]);
}

#[test]
fn segments_sharing_a_page_are_mapped_once_with_combined_permissions() {
    let image = ElfBuilder::new(0x1000)
        .load(PF_R | PF_X, 0x1000, &[0x90; 0x10], 0x10)
        .load(PF_R | PF_W, 0x1800, b"DATA", 0x100)
        .build();

    let mut vm = FakeMemory::new();
    let entry = load_image(&mut vm, SPACE, &image).unwrap();

    assert_eq!(entry, VirtualAddress::new(0x1000));
    assert_eq!(vm.mapped(), vec![0x1000]);
    assert_eq!(
        vm.ops,
        vec![
            Op::Map(0x1000, rw()),
            Op::Write(0x1000, 0x10),
            Op::Protect(0x1000, rwx()),
            Op::Write(0x1800, 4),
            Op::Zero(0x1804, 0xFC),
        ]
    );
    assert_eq!(vm.access(0x1000), Some(rwx()));
    assert_eq!(vm.read(0x1000, 0x10), vec![0x90; 0x10]);
    assert_eq!(vm.read(0x1800, 4), b"DATA");
    assert_eq!(vm.read(0x1804, 0xFC), vec![0; 0xFC]);
    // Between the two segments the frame keeps its previous contents.
    assert_eq!(vm.read(0x1010, 0x10), vec![FRESH_FILL; 0x10]);
}

#[test]
fn spanning_segment_maps_only_the_pages_not_yet_mapped() {
    let image = ElfBuilder::new(0x1000)
        .load(PF_R | PF_X, 0x1000, &[0x90; 0x10], 0x10)
        .load(PF_R | PF_W, 0x1800, &[], 0x1000)
        .build();

    let mut vm = FakeMemory::new();
    load_image(&mut vm, SPACE, &image).unwrap();

    assert_eq!(vm.mapped(), vec![0x1000, 0x2000]);
    assert_eq!(vm.maps(), 2);
    assert_eq!(vm.access(0x1000), Some(rwx()));
    assert_eq!(vm.access(0x2000), Some(rw()));
    assert_eq!(vm.read(0x1800, 0x1000), vec![0; 0x1000]);
}

#[test]
fn first_map_failure_stops_the_load() {
    let image = ElfBuilder::new(0x40_0000)
        .load(PF_R | PF_X, 0x40_0000, &[0x90; 0x3000], 0x3000)
        .build();

    let mut vm = FakeMemory::new().failing_map_at(0x40_1000);
    let err = load_image(&mut vm, SPACE, &image).unwrap_err();

    assert!(matches!(err, LoadError::Map(_)));
    assert_eq!(vm.ops, vec![Op::Map(0x40_0000, rw())]);
}

#[test]
fn malformed_images_are_rejected_before_any_mapping() {
    let cases: [(Vec<u8>, fn(&LoadError) -> bool); 6] = [
        (
            ElfBuilder::new(0x1000)
                .load(PF_R, 0x1000, &[1; 0x20], 0x10)
                .build(),
            |e| matches!(e, LoadError::MemSizeBelowFileSize { .. }),
        ),
        (
            ElfBuilder::new(0x1000)
                .load(PF_R, 0x1000, &[1; 0x10], 0x900)
                .load(PF_R | PF_W, 0x1800, &[2; 0x10], 0x10)
                .build(),
            |e| matches!(e, LoadError::OverlappingSegments { .. }),
        ),
        (
            ElfBuilder::new(0x10)
                .load(PF_R | PF_X, 0x0, &[0x90; 0x10], 0x10)
                .build(),
            |e| matches!(e, LoadError::NullPage(_)),
        ),
        (
            ElfBuilder::new(0x1000)
                .load(PF_R, 0x7FFF_FFFF_F000, &[0; 8], 0x2000)
                .build(),
            |e| matches!(e, LoadError::OutsideUserSpace(_)),
        ),
        (
            ElfBuilder::new(0xFFFF_8000_0000_0000)
                .load(PF_R | PF_X, 0x1000, &[0x90], 1)
                .build(),
            |e| matches!(e, LoadError::EntryOutsideUserSpace(_)),
        ),
        (
            ElfBuilder::new(0x1000)
                .e_type(3)
                .load(PF_R | PF_X, 0x1000, &[0x90], 1)
                .build(),
            |e| matches!(e, LoadError::Elf(ElfError::NotExecutable(3))),
        ),
    ];

    for (image, expected) in cases {
        let mut vm = FakeMemory::new();
        let err = load_image(&mut vm, SPACE, &image).unwrap_err();
        assert!(expected(&err), "unexpected error {err:?}");
        assert!(vm.ops.is_empty(), "{err}: touched memory");
    }
}

#[test]
fn file_range_past_the_image_is_rejected() {
    let mut image = ElfBuilder::new(0x1000)
        .load(PF_R, 0x1000, &[1; 0x10], 0x10)
        .build();
    // Push p_offset of the only segment past the end of the file.
    image[64 + 8..64 + 16].copy_from_slice(&0x10_0000u64.to_le_bytes());

    assert!(matches!(
        LoadPlan::new(&image),
        Err(LoadError::FileRangeOutOfBounds { .. })
    ));
}

#[test]
fn segments_may_not_land_on_the_stack_or_argument_page() {
    let layout = UserLayout::DEFAULT;
    let image = ElfBuilder::new(0x600_0000_0000)
        .load(PF_R | PF_X, 0x600_0000_0000, &[0x90], 1)
        .build();

    assert!(LoadPlan::new(&image).is_ok());
    assert_eq!(
        LoadPlan::for_layout(&image, &layout).err(),
        Some(LoadError::ReservedRegionCollision(VirtualAddress::new(
            0x600_0000_0000
        )))
    );
}

#[test]
fn plan_lists_segments_in_table_order() {
    let image = common::sample_image();
    let plan = LoadPlan::new(&image).unwrap();

    let vaddrs: Vec<u64> = plan.segments().map(|s| s.vaddr().as_u64()).collect();
    assert_eq!(vaddrs, vec![0x40_0000, 0x40_1000]);

    let mut vm = FakeMemory::new();
    let entry = SegmentLoader::new(&mut vm, SPACE).load(&plan).unwrap();
    assert_eq!(entry, plan.entry());
    assert_eq!(vm.read(0x40_1000, 4), b"DATA");
}
