use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ring_pipeline::{MapStage, PassthroughStage, PipelineBuilder, StageHandler, WaitStrategy};
use std::time::Duration;

/// A slow middle stage throttles the producer through the terminal stage.
fn benchmark_slow_middle_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("slow_middle_stage_1000_msgs");
    group.sample_size(10);

    let strategies = [
        ("busy_spin", WaitStrategy::BusySpin),
        ("yielding", WaitStrategy::Yielding),
        ("sleeping", WaitStrategy::Sleeping { max_micros: 50 }),
    ];

    for (label, strategy) in strategies {
        group.bench_with_input(BenchmarkId::from_parameter(label), &strategy, |b, &strategy| {
            b.iter(|| {
                let mut running = PipelineBuilder::<u64>::new(64)
                    .add_stage("fast")
                    .add_stage("slow")
                    .add_stage("sink")
                    .with_wait_strategy(strategy)
                    .build()
                    .expect("Build failed")
                    .start(|stage_idx| -> Box<dyn StageHandler<u64>> {
                        if stage_idx == 1 {
                            Box::new(MapStage::new("slow", |v: &mut u64| {
                                std::thread::sleep(Duration::from_micros(20));
                                *v += 1;
                                Ok(())
                            }))
                        } else {
                            Box::new(PassthroughStage)
                        }
                    })
                    .expect("Start failed");

                for i in 0..1000 {
                    running.publish(black_box(i)).expect("Publish failed");
                }
                running.shutdown().expect("Shutdown failed");
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_slow_middle_stage);
criterion_main!(benches);
