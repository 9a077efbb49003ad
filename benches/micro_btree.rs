#![forbid(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vos::btree::{BytesVal, ProbeOp, Tree, TreeOptions, UintKey};

const COUNTS: [usize; 3] = [1_000, 10_000, 100_000];

fn default_opts() -> TreeOptions {
    TreeOptions {
        order: 32,
        dynamic_root: false,
        skip_leaf_rebalance: false,
        embed_first: true,
    }
}

fn micro_btree_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree/insert");
    group.sample_size(20);

    for count in COUNTS {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("upsert", count), &count, |b, &count| {
            b.iter(|| {
                let mut tree: Tree<UintKey, BytesVal> = Tree::new(default_opts()).expect("new");
                for i in 0..count as u64 {
                    tree.upsert(&UintKey(i), &BytesVal(i.to_le_bytes().to_vec()))
                        .expect("upsert");
                }
                black_box(tree.len())
            });
        });
    }
    group.finish();
}

fn micro_btree_probe(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree/probe");
    group.sample_size(20);

    for count in COUNTS {
        let mut tree: Tree<UintKey, BytesVal> = Tree::new(default_opts()).expect("new");
        for i in 0..count as u64 {
            tree.upsert(&UintKey(i), &BytesVal(i.to_le_bytes().to_vec()))
                .expect("upsert");
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("eq", count), &count, |b, &count| {
            let probe_key = UintKey((count / 2) as u64);
            b.iter(|| black_box(tree.probe(ProbeOp::Eq, Some(&probe_key)).expect("probe")));
        });
    }
    group.finish();
}

criterion_group!(benches, micro_btree_insert, micro_btree_probe);
criterion_main!(benches);
