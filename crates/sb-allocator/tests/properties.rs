#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use core::ops::Range;

use proptest::prelude::*;
use sb_allocator::{BASE_VADDR, Config, Handle, SegmentAllocator, SegmentInfo};

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    Map(usize),
    /// Removes the segment at `index % segment_count`.
    Release(usize),
    Write(usize, u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0_usize..6).prop_map(Op::Allocate),
        (0_usize..6).prop_map(Op::Map),
        any::<usize>().prop_map(Op::Release),
        (any::<usize>(), any::<u32>()).prop_map(|(i, v)| Op::Write(i, v)),
    ]
}

/// Reference model: one `Vec` per segment, in table order.
#[derive(Debug, Default)]
struct Model {
    segments: Vec<(Vec<u32>, bool)>,
}

impl Model {
    fn flat(&self) -> Vec<u32> {
        self.segments
            .iter()
            .flat_map(|(values, _)| values.iter().copied())
            .collect()
    }
}

fn assert_partition(segments: &[SegmentInfo], total_limit: usize) {
    let mut expected = BASE_VADDR;
    for segment in segments {
        assert_eq!(segment.virtual_range.start, expected);
        assert!(segment.virtual_range.start <= segment.virtual_range.end);
        expected = segment.virtual_range.end;
    }
    assert_eq!(expected, total_limit);
    let total: usize = segments.iter().map(|s| s.virtual_range.len()).sum();
    assert_eq!(total_limit - BASE_VADDR, total);
}

fn ranges(segments: &[SegmentInfo]) -> Vec<Range<usize>> {
    segments.iter().map(|s| s.virtual_range.clone()).collect()
}

proptest! {
    #[test]
    fn segment_table_matches_model(ops in prop::collection::vec(op(), 1..40), thread_safe in any::<bool>()) {
        let allocator = SegmentAllocator::<u32>::with_config(Config::new().with_thread_safe(thread_safe));
        let mut model = Model::default();
        // Foreign buffers must outlive their mappings.
        let mut buffers: Vec<Vec<u32>> = Vec::new();

        for op in ops {
            let before = allocator.segments();
            match op {
                Op::Allocate(count) => {
                    let handle = allocator.allocate(count).unwrap();
                    prop_assert_eq!(handle.vaddr(), before.last().map_or(BASE_VADDR, |s| s.virtual_range.end));
                    model.segments.push((vec![0; count], true));
                }
                Op::Map(count) => {
                    let mut buffer = vec![0_u32; count];
                    let ptr = core::ptr::NonNull::new(buffer.as_mut_ptr()).unwrap();
                    buffers.push(buffer);
                    let _ = unsafe { allocator.mmap(ptr, count) };
                    model.segments.push((vec![0; count], false));
                }
                Op::Release(index) => {
                    if before.is_empty() {
                        continue;
                    }
                    // A release names a base address; empty segments share it
                    // with the segment after them, which is the one released.
                    let base = before[index % before.len()].virtual_range.start;
                    let index = before
                        .iter()
                        .rposition(|s| s.virtual_range.start == base)
                        .unwrap();
                    let removed = &before[index];
                    let handle = allocator.begin() + (base - BASE_VADDR) / 4;
                    if removed.owned {
                        allocator.deallocate(&handle).unwrap();
                    } else {
                        allocator.unmap(&handle).unwrap();
                    }
                    model.segments.remove(index);

                    // Compaction law.
                    let size = removed.virtual_range.len();
                    let after = allocator.segments();
                    let mut expected = ranges(&before);
                    expected.remove(index);
                    for range in &mut expected[index..] {
                        *range = range.start - size..range.end - size;
                    }
                    prop_assert_eq!(ranges(&after), expected);
                }
                Op::Write(index, value) => {
                    let len = allocator.len();
                    if len == 0 {
                        continue;
                    }
                    let index = index % len;
                    allocator.begin().write_at(index, value).unwrap();
                    let mut remaining = index;
                    for (values, _) in &mut model.segments {
                        if remaining < values.len() {
                            values[remaining] = value;
                            break;
                        }
                        remaining -= values.len();
                    }
                }
            }

            let segments = allocator.segments();
            assert_partition(&segments, allocator.total_limit());
            let owned: Vec<bool> = segments.iter().map(|s| s.owned).collect();
            let model_owned: Vec<bool> = model.segments.iter().map(|(_, owned)| *owned).collect();
            prop_assert_eq!(owned, model_owned);
            prop_assert_eq!(allocator.to_vec().unwrap(), model.flat());
        }

        drop(allocator);
        drop(buffers);
    }

    #[test]
    fn cache_never_changes_translation(
        counts in prop::collection::vec(1_usize..5, 1..8),
        probes in prop::collection::vec(any::<usize>(), 1..64),
    ) {
        let cached = SegmentAllocator::<u16>::with_config(Config::new().with_profiling(true));
        for &count in &counts {
            cached.allocate(count).unwrap();
        }
        let limit = cached.total_limit();
        let segments = cached.segments();

        for probe in probes {
            let vaddr = BASE_VADDR + probe % (limit - BASE_VADDR + 2);
            let resolved = cached.translate(vaddr);
            let expected = segments
                .iter()
                .find(|s| s.virtual_range.contains(&vaddr))
                .map(|s| s.physical_base + (vaddr - s.virtual_range.start));
            prop_assert_eq!(resolved.ok().map(|p| p.addr().get()), expected);
        }
    }

    #[test]
    fn write_then_read_round_trips(count in 1_usize..32, index in any::<usize>(), value in any::<i64>()) {
        let allocator = SegmentAllocator::<i64>::new();
        allocator.allocate(count).unwrap();
        let handle: Handle<i64> = allocator.begin() + index % count;
        handle.write(value).unwrap();
        prop_assert_eq!(handle.read().unwrap(), value);
    }

    #[test]
    fn deep_copy_matches_source(counts in prop::collection::vec(0_usize..6, 0..6)) {
        let source = SegmentAllocator::<u8>::new();
        for &count in &counts {
            source.allocate(count).unwrap();
        }
        for (handle, value) in source.handles().zip(1_u8..) {
            handle.write(value).unwrap();
        }
        let copy = source.try_clone().unwrap();
        prop_assert_eq!(ranges(&copy.segments()), ranges(&source.segments()));
        prop_assert_eq!(copy.to_vec().unwrap(), source.to_vec().unwrap());
    }
}
