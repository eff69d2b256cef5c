use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use hubd::servers::hub::charstatus::{Item, MAX_INVENTORY, MAX_STORAGE};
use hubd::servers::hub::db::ItemTable;
use hubd::servers::hub::persist::plan_items;

fn stored(n: usize) -> Vec<Item> {
    (0..n)
        .map(|i| Item {
            id: i as u64 + 1,
            nameid: 500 + (i % 40) as u32,
            amount: 1 + (i % 7) as u32,
            unique_id: i as u64,
            ..Default::default()
        })
        .collect()
}

/// A typical autosave: a few amounts changed, one item gone, one new.
fn incoming(stored: &[Item]) -> Vec<Item> {
    let mut out: Vec<Item> = stored.iter().map(|i| Item { id: 0, ..i.clone() }).collect();
    for it in out.iter_mut().step_by(17) {
        it.amount += 1;
    }
    out.pop();
    out.push(Item { nameid: 1201, amount: 1, unique_id: 999_999, ..Default::default() });
    out
}

fn bench_plan_items(c: &mut Criterion) {
    let inv = stored(MAX_INVENTORY);
    let inv_new = incoming(&inv);
    c.bench_function("plan_items inventory unchanged", |b| {
        b.iter(|| plan_items(ItemTable::Inventory, 1, black_box(&inv), black_box(&inv)))
    });
    c.bench_function("plan_items inventory autosave", |b| {
        b.iter(|| plan_items(ItemTable::Inventory, 1, black_box(&inv), black_box(&inv_new)))
    });

    let sto = stored(MAX_STORAGE);
    let sto_new = incoming(&sto);
    c.bench_function("plan_items storage autosave", |b| {
        b.iter(|| plan_items(ItemTable::Storage, 1, black_box(&sto), black_box(&sto_new)))
    });
}

criterion_group!(benches, bench_plan_items);
criterion_main!(benches);
