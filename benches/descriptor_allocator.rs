use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use model_viewer::backend::{SoftwareDevice, root};
use model_viewer::descriptor::DescriptorAllocator;

const TABLE: u32 = root::MATERIAL_TABLE_SIZE;
const TABLES: u32 = 64;

fn pool() -> DescriptorAllocator {
    let mut device = SoftwareDevice::default();
    DescriptorAllocator::create(&mut device, TABLE * TABLES, "bench pool").unwrap()
}

// ---------------------------------------------------------------------------
// Material tables
// ---------------------------------------------------------------------------

fn bench_allocate_tables(c: &mut Criterion) {
    c.bench_function("allocate_64_material_tables", |b| {
        b.iter_batched(
            pool,
            |mut allocator| {
                for _ in 0..TABLES {
                    black_box(allocator.allocate_contiguous(TABLE).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_allocate_and_free_tables(c: &mut Criterion) {
    c.bench_function("allocate_free_64_material_tables", |b| {
        b.iter_batched(
            pool,
            |mut allocator| {
                let ranges: Vec<_> = (0..TABLES)
                    .map(|_| allocator.allocate_contiguous(TABLE).unwrap())
                    .collect();
                for range in ranges.iter().rev() {
                    allocator.free_range(range).unwrap();
                }
                black_box(allocator.free_count());
            },
            BatchSize::SmallInput,
        );
    });
}

// ---------------------------------------------------------------------------
// Fragmentation
// ---------------------------------------------------------------------------

/// Every other table freed; the next table must come from the tail.
fn fragmented_pool() -> DescriptorAllocator {
    let mut allocator = pool();
    let ranges: Vec<_> = (0..TABLES)
        .map(|_| allocator.allocate_contiguous(TABLE).unwrap())
        .collect();
    for range in ranges.iter().step_by(2) {
        allocator.free_range(range).unwrap();
    }
    allocator
}

fn bench_first_fit_fragmented(c: &mut Criterion) {
    c.bench_function("first_fit_fragmented_pool", |b| {
        b.iter_batched(
            fragmented_pool,
            |mut allocator| {
                black_box(allocator.allocate_contiguous(TABLE).unwrap());
                black_box(allocator.allocate_contiguous(TABLE * 2).is_err());
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_single_slots(c: &mut Criterion) {
    c.bench_function("allocate_free_single_slots", |b| {
        b.iter_batched(
            fragmented_pool,
            |mut allocator| {
                for _ in 0..TABLE {
                    let range = allocator.allocate_single().unwrap();
                    allocator.free(range.cpu_handle(0)).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_allocate_tables,
    bench_allocate_and_free_tables,
    bench_first_fit_fragmented,
    bench_single_slots,
);
criterion_main!(benches);
