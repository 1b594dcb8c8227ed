use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ripple_core::StateManager;

fn update_snapshot_fan_out(c: &mut Criterion) {
    let manager = StateManager::new();
    let source = manager.mutable_state(0u64, Some(true)).expect("state");
    let readers: Vec<_> = (0..256u64)
        .map(|offset| {
            let source = source.clone();
            manager
                .computable_state(move |_| Ok(source.value()? + offset))
                .expect("computable")
        })
        .collect();
    for reader in &readers {
        reader.value().expect("initial value");
    }

    c.bench_function("update_snapshot_fan_out_256", |b| {
        let mut next = 0u64;
        b.iter(|| {
            next += 1;
            source.set(next).expect("write");
            manager.sync_changes();
            manager.update_snapshot().expect("update");
            for reader in &readers {
                black_box(reader.value().expect("value"));
            }
        });
    });
}

fn keyed_repeat_unchanged(c: &mut Criterion) {
    let manager = StateManager::new();
    let tick = manager.mutable_state(0u32, Some(true)).expect("state");
    let items: Vec<u32> = (0..512).collect();
    let root = {
        let tick = tick.clone();
        manager
            .updatable_node((), move |cx| {
                tick.value()?;
                cx.repeat_with_key(&items, |item, _| *item, |cx, _, _| {
                    cx.attach(|| (), |_, _| Ok(()))?;
                    Ok(())
                })
            })
            .expect("root")
    };
    root.value().expect("initial render");

    c.bench_function("keyed_repeat_unchanged_512", |b| {
        let mut next = 0u32;
        b.iter(|| {
            next += 1;
            tick.set(next).expect("write");
            manager.sync_changes();
            manager.update_snapshot().expect("update");
            black_box(root.value().expect("render"));
        });
    });
}

criterion_group!(benches, update_snapshot_fan_out, keyed_repeat_unchanged);
criterion_main!(benches);
