//! Differ benchmarks.
//!
//! Run with: cargo bench -p patchwire-core --bench diff
//!
//! Builds keyed lists of several sizes and measures the diff after a small
//! edit, a rotation and a full reversal, plus encoding the resulting frame.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use patchwire_core::protocol::{Frame, PatchFrame};
use patchwire_core::reactive::Runtime;
use patchwire_core::render::{diff, el, keyed_list, HidAllocator, Node, TreeBuilder, VNode};
use patchwire_core::session::RenderListener;

/// `ul` of `li` rows keyed by id, each row labelled with its value.
fn build_rows(rows: &[(u32, u32)]) -> Vec<Node> {
    let rt = Runtime::new();
    let mut builder = TreeBuilder::new(&rt, Arc::new(RenderListener::new()));
    let tree: VNode = el("ul")
        .child(keyed_list(
            rows.to_vec(),
            |(id, _)| format!("row-{id}"),
            |(id, value)| {
                el("li")
                    .attr("data-id", id.to_string())
                    .child(el("span").text(format!("value {value}")))
                    .into()
            },
        ))
        .into();
    builder.build(&tree).unwrap_or_default()
}

fn mounted(rows: &[(u32, u32)]) -> (Vec<Node>, HidAllocator) {
    let mut hids = HidAllocator::new();
    let mut nodes = build_rows(rows);
    diff(&[], &mut nodes, &mut hids);
    (nodes, hids)
}

fn bench_edits(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff/keyed");

    for size in [100u32, 1_000, 10_000] {
        let rows: Vec<(u32, u32)> = (0..size).map(|id| (id, 0)).collect();
        let (old, hids) = mounted(&rows);

        let mut touched = rows.clone();
        for row in touched.iter_mut().step_by(10) {
            row.1 += 1;
        }
        let mut rotated = rows.clone();
        rotated.rotate_right(1);
        let mut reversed = rows.clone();
        reversed.reverse();

        group.throughput(Throughput::Elements(u64::from(size)));
        for (name, next) in [("touch_10pct", &touched), ("rotate", &rotated), ("reverse", &reversed)] {
            let new = build_rows(next);
            group.bench_with_input(BenchmarkId::new(name, size), &new, |b, new| {
                b.iter_batched(
                    || (new.clone(), hids.clone()),
                    |(mut new, mut hids)| black_box(diff(&old, &mut new, &mut hids)),
                    BatchSize::LargeInput,
                )
            });
        }
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let rows: Vec<(u32, u32)> = (0..1_000).map(|id| (id, 0)).collect();
    let mut hids = HidAllocator::new();
    let mut nodes = build_rows(&rows);
    let patches = diff(&[], &mut nodes, &mut hids);
    let frame = Frame::Patches(PatchFrame {
        sequence: 1,
        ack: None,
        patches,
    });

    c.bench_function("encode/mount_1000_rows", |b| b.iter(|| black_box(frame.encode())));
}

criterion_group!(benches, bench_edits, bench_encode);
criterion_main!(benches);
