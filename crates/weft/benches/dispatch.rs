use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft::{Configuration, Dispatcher, FrameAllocatorConfig, SequencerConfiguration, Sequencer};

fn bench_post(c: &mut Criterion) {
    let mut group = c.benchmark_group("post");

    for threads in [1usize, 4] {
        let dispatcher =
            Dispatcher::new(Configuration::default().with_coro_threads(threads)).unwrap();
        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::new("heap", threads), &threads, |b, _| {
            b.iter(|| {
                let futures: Vec<_> = (0..100u64)
                    .map(|i| dispatcher.post(move |_| async move { Ok(black_box(i)) }).unwrap())
                    .collect();
                futures.into_iter().map(|f| f.get().unwrap()).sum::<u64>()
            });
        });
    }

    let pooled = Dispatcher::new(
        Configuration::default()
            .with_coro_threads(4)
            .with_frame_allocator(FrameAllocatorConfig::Pool {
                block_size: 1024,
                block_count: 256,
                heap_fallback: true,
            }),
    )
    .unwrap();
    group.bench_function("pool/4", |b| {
        b.iter(|| {
            let futures: Vec<_> = (0..100u64)
                .map(|i| pooled.post(move |_| async move { Ok(black_box(i)) }).unwrap())
                .collect();
            futures.into_iter().map(|f| f.get().unwrap()).sum::<u64>()
        });
    });

    group.finish();
}

fn bench_yield(c: &mut Criterion) {
    let dispatcher = Dispatcher::new(Configuration::default().with_coro_threads(1)).unwrap();

    c.bench_function("yield_x100", |b| {
        b.iter(|| {
            dispatcher
                .post(|ctx| async move {
                    for _ in 0..100 {
                        ctx.yield_now().await;
                    }
                    Ok(())
                })
                .unwrap()
                .get()
                .unwrap()
        });
    });
}

fn bench_sequencer(c: &mut Criterion) {
    let dispatcher = Dispatcher::new(Configuration::default().with_coro_threads(4)).unwrap();
    let sequencer: Sequencer<u32> = dispatcher.sequencer(SequencerConfiguration::default());

    c.bench_function("enqueue_8_keys_x100", |b| {
        b.iter(|| {
            let futures: Vec<_> = (0..100u32)
                .map(|i| sequencer.enqueue(i % 8, move |_| async move { Ok(i) }).unwrap())
                .collect();
            for future in futures {
                black_box(future.get().unwrap());
            }
        });
    });
}

criterion_group!(benches, bench_post, bench_yield, bench_sequencer);
criterion_main!(benches);
