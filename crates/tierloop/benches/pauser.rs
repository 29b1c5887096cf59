use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tierloop::{
    handler_fn, AdaptivePauser, BusyPauser, EventLoop, LoopSettings, Pauser, SleepyPauser,
    ThreadedEventLoop, YieldingPauser,
};

fn bench_idle_pause(c: &mut Criterion) {
    let mut group = c.benchmark_group("idle_pause");

    let pausers: Vec<(&str, Arc<dyn Pauser>)> = vec![
        ("busy", Arc::new(BusyPauser)),
        ("yielding", Arc::new(YieldingPauser::new(Duration::ZERO))),
        (
            "adaptive_spin",
            Arc::new(AdaptivePauser::with_spin(Duration::from_secs(1), Duration::from_micros(200))),
        ),
    ];

    for (name, pauser) in pausers {
        group.bench_with_input(BenchmarkId::new("pause", name), &pauser, |b, pauser| {
            b.iter(|| black_box(pauser).pause());
        });
    }

    group.finish();
}

fn bench_unpause(c: &mut Criterion) {
    let adaptive = AdaptivePauser::with_spin(Duration::ZERO, Duration::from_millis(1));
    c.bench_function("adaptive_unpause_no_sleeper", |b| {
        b.iter(|| {
            adaptive.unpause();
            adaptive.reset();
        });
    });
}

/// Wake a sleeping pauser from another thread and time how long until the
/// sleeper returns.
fn bench_wake_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("wake_round_trip");
    group.sample_size(20);

    let pausers: Vec<(&str, Arc<dyn Pauser>)> = vec![
        ("adaptive", Arc::new(AdaptivePauser::with_spin(Duration::ZERO, Duration::from_millis(50)))),
        ("sleepy", Arc::new(SleepyPauser::new(Duration::from_millis(50)))),
    ];

    for (name, pauser) in pausers {
        group.bench_with_input(BenchmarkId::new("unpause", name), &pauser, |b, pauser| {
            b.iter_custom(|iters| {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    pauser.reset();
                    let sleeper = {
                        let pauser = pauser.clone();
                        thread::spawn(move || {
                            let start = Instant::now();
                            pauser.pause();
                            start.elapsed()
                        })
                    };
                    thread::sleep(Duration::from_micros(200));
                    pauser.unpause();
                    total += sleeper.join().unwrap_or_default();
                }
                total
            });
        });
    }

    group.finish();
}

/// Time from `add_handler` on an idle core-style loop until the handler's
/// first step runs on the loop thread.
fn bench_core_handoff(c: &mut Criterion) {
    let pauser = Arc::new(AdaptivePauser::with_spin(
        Duration::from_micros(20),
        Duration::from_micros(200),
    ));
    let event_loop = ThreadedEventLoop::new(LoopSettings::new("bench-core", pauser));
    event_loop.start().unwrap();

    c.bench_function("core_handoff", |b| {
        b.iter(|| {
            let ran = Arc::new(AtomicU64::new(0));
            let flag = ran.clone();
            event_loop
                .add_handler(Box::new(handler_fn("handoff", None, move || {
                    flag.store(1, Ordering::Release);
                    Err(tierloop::HandlerError::Retired)
                })))
                .unwrap();
            while ran.load(Ordering::Acquire) == 0 {
                std::hint::spin_loop();
            }
        });
    });

    event_loop.close();
}

criterion_group!(
    benches,
    bench_idle_pause,
    bench_unpause,
    bench_wake_round_trip,
    bench_core_handoff
);
criterion_main!(benches);
