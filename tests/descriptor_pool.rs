//! Descriptor pool exhaustion, fragmentation and release.

use rstest::rstest;

use model_viewer::backend::*;
use model_viewer::descriptor::DescriptorAllocator;
use model_viewer::ViewerError;

const TABLE: u32 = root::MATERIAL_TABLE_SIZE;

fn pool(capacity: u32) -> (SoftwareDevice, DescriptorAllocator) {
    let mut device = SoftwareDevice::default();
    let allocator = DescriptorAllocator::create(&mut device, capacity, "pool").unwrap();
    (device, allocator)
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(5)]
#[case(16)]
fn test_material_tables_exhaust_after_n(#[case] tables: u32) {
    let (_device, mut allocator) = pool(TABLE * tables);
    let ranges: Vec<_> = (0..tables)
        .map(|_| allocator.allocate_contiguous(TABLE).unwrap())
        .collect();
    for (i, range) in ranges.iter().enumerate() {
        assert_eq!(range.index, i as u32 * TABLE);
    }
    assert!(matches!(
        allocator.allocate_contiguous(TABLE),
        Err(ViewerError::OutOfSlots {
            requested: TABLE,
            available: 0
        })
    ));
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(28)]
#[case(59)]
fn test_free_each_slot_restores_pool(#[case] count: u32) {
    let (_device, mut allocator) = pool(64);
    // Start from a fragmented pool.
    let a = allocator.allocate_contiguous(3).unwrap();
    let _b = allocator.allocate_contiguous(2).unwrap();
    allocator.free_range(&a).unwrap();
    let before = allocator.free_indices();

    let range = allocator.allocate_contiguous(count).unwrap();
    for offset in (0..count).rev() {
        allocator.free(range.cpu_handle(offset)).unwrap();
    }
    assert_eq!(allocator.free_indices(), before);
}

#[test]
fn test_fragmented_pool_has_no_run() {
    let (_device, mut allocator) = pool(TABLE * 3);
    let first = allocator.allocate_contiguous(TABLE).unwrap();
    let _second = allocator.allocate_contiguous(TABLE).unwrap();
    let third = allocator.allocate_contiguous(TABLE).unwrap();
    allocator.free_range(&third).unwrap();
    allocator.free_range(&first).unwrap();

    assert!(matches!(
        allocator.allocate_contiguous(TABLE * 2),
        Err(ViewerError::NoContiguousRun {
            requested: 56,
            available: 56
        })
    ));
    // First fit takes the lowest run.
    assert_eq!(allocator.allocate_contiguous(TABLE).unwrap().index, 0);
    assert_eq!(allocator.allocate_contiguous(TABLE).unwrap().index, TABLE * 2);
}

#[test]
fn test_rejected_frees_leave_pool_unchanged() {
    let (_device, mut allocator) = pool(8);
    let range = allocator.allocate_contiguous(4).unwrap();
    let before = allocator.free_indices();
    let start = allocator.heap().cpu_start;
    let increment = allocator.heap().increment;

    assert!(matches!(
        allocator.free(CpuDescriptorHandle(start.0 + 1)),
        Err(ViewerError::InvalidHandle(_))
    ));
    assert!(matches!(
        allocator.free(CpuDescriptorHandle(start.0 - increment as u64)),
        Err(ViewerError::InvalidHandle(_))
    ));
    assert!(matches!(
        allocator.free(start.offset(8, increment)),
        Err(ViewerError::IndexOutOfRange { index: 8, capacity: 8 })
    ));
    assert!(matches!(
        allocator.free(range.cpu_handle(0)).and_then(|()| allocator.free(range.cpu_handle(0))),
        Err(ViewerError::InvalidHandle(_))
    ));
    let mut expected = before;
    expected.insert(0, range.index);
    assert_eq!(allocator.free_indices(), expected);
}
