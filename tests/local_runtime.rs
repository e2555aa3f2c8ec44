//! Single-process runtime scenarios: dependency ordering, yielding,
//! priorities, cancellation and the completion APIs.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskmesh::{
    yield_now, LoopbackFabric, Priority, Runtime, SegmentId, TaskDep, TaskError, TaskFlags,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_runtime(workers: usize) -> Result<Runtime> {
    init_tracing();
    Ok(Runtime::builder()
        .worker_threads(workers)
        .task_stack_size(64 << 10)
        .build(LoopbackFabric::new(1).endpoint(0))?)
}

#[test]
fn raw_ordering_between_two_tasks() -> Result<()> {
    let rt = small_runtime(2)?;
    let value = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(AtomicU32::new(0));
    let key = rt.local_ptr(0x1000);

    let v = value.clone();
    rt.task(move || {
        v.store(42, Ordering::SeqCst);
    })
    .depends_on(TaskDep::output(key))
    .describe("producer")
    .submit()?;

    let (v, s) = (value.clone(), seen.clone());
    rt.task(move || {
        s.store(v.load(Ordering::SeqCst), Ordering::SeqCst);
    })
    .depends_on(TaskDep::input(key))
    .describe("consumer")
    .submit()?;

    rt.task_complete(true)?;
    assert_eq!(seen.load(Ordering::SeqCst), 42);
    assert_eq!(rt.stats().tasks_in_flight, 0);
    Ok(())
}

#[test]
fn inout_chain_runs_in_submission_order() -> Result<()> {
    let rt = small_runtime(4)?;
    let log = Arc::new(Mutex::new(Vec::new()));
    let key = rt.local_ptr(0x2000);

    for i in 0..16usize {
        let log = log.clone();
        rt.task(move || {
            log.lock().unwrap().push(i);
        })
        .depends_on(TaskDep::inout(key))
        .submit()?;
    }
    rt.task_complete(true)?;

    let log = log.lock().unwrap();
    assert_eq!(*log, (0..16).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn write_after_read_ordering() -> Result<()> {
    let rt = small_runtime(2)?;
    let reader_done = Arc::new(AtomicBool::new(false));
    let writer_saw_reader = Arc::new(AtomicBool::new(false));
    let key = rt.local_ptr(0x3000);

    let done = reader_done.clone();
    rt.task(move || {
        // Give a racing writer a chance to overtake illegally.
        std::thread::sleep(Duration::from_millis(10));
        done.store(true, Ordering::SeqCst);
    })
    .depends_on(TaskDep::input(key))
    .submit()?;

    let (done, saw) = (reader_done.clone(), writer_saw_reader.clone());
    rt.task(move || {
        saw.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
    })
    .depends_on(TaskDep::output(key))
    .submit()?;

    rt.task_complete(true)?;
    assert!(writer_saw_reader.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn independent_tasks_all_run() -> Result<()> {
    let rt = small_runtime(4)?;
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let counter = counter.clone();
        rt.task(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .submit()?;
    }
    rt.task_complete(true)?;
    assert_eq!(counter.load(Ordering::SeqCst), 64);
    assert!(rt.stats().tasks_executed >= 64);
    Ok(())
}

#[test]
fn yielding_task_resumes_and_finishes() -> Result<()> {
    let rt = small_runtime(2)?;
    let steps = Arc::new(AtomicUsize::new(0));

    let s = steps.clone();
    rt.task(move || {
        for _ in 0..3 {
            s.fetch_add(1, Ordering::SeqCst);
            yield_now(-1).unwrap();
        }
        s.fetch_add(1, Ordering::SeqCst);
    })
    .submit()?;

    // A second task so the yield has somewhere to go.
    rt.task(|| {}).submit()?;

    rt.task_complete(true)?;
    assert_eq!(steps.load(Ordering::SeqCst), 4);
    Ok(())
}

#[test]
fn high_priority_overtakes_queued_low_priority() -> Result<()> {
    // Single worker: the master drains everything in task_complete, so the
    // queue order is observable. The first eight tasks fill the hot slots;
    // later submissions land in the shared queue where priority applies.
    let rt = small_runtime(1)?;
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..12 {
        let log = log.clone();
        rt.task(move || log.lock().unwrap().push("low"))
            .priority(Priority::Low)
            .submit()?;
    }
    let l = log.clone();
    rt.task(move || l.lock().unwrap().push("high"))
        .priority(Priority::High)
        .submit()?;

    rt.task_complete(true)?;

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 13);
    let high_pos = log.iter().position(|e| *e == "high").unwrap();
    // The high-priority task beats every low task that sat in the queue.
    assert!(high_pos < 12, "high-priority task ran last: {high_pos}");
    Ok(())
}

#[test]
fn yield_fairness_for_high_priority_task() -> Result<()> {
    let rt = small_runtime(2)?;
    let high_done = Arc::new(AtomicBool::new(false));
    let lows_done = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let done = lows_done.clone();
        let high = high_done.clone();
        let observed = Arc::new(AtomicBool::new(false));
        rt.task(move || {
            for _ in 0..10 {
                if high.load(Ordering::SeqCst) {
                    observed.store(true, Ordering::SeqCst);
                }
                yield_now(-1).unwrap();
            }
            done.fetch_add(1, Ordering::SeqCst);
        })
        .priority(Priority::Low)
        .submit()?;
    }

    let (high, lows) = (high_done.clone(), lows_done.clone());
    rt.task(move || {
        // The yielding low tasks must still be in flight when the
        // high-priority task gets scheduled.
        assert!(lows.load(Ordering::SeqCst) < 8);
        high.store(true, Ordering::SeqCst);
    })
    .priority(Priority::High)
    .submit()?;

    rt.task_complete(true)?;
    assert!(high_done.load(Ordering::SeqCst));
    assert_eq!(lows_done.load(Ordering::SeqCst), 8);
    Ok(())
}

#[test]
fn cancellation_terminates_spinning_tasks() -> Result<()> {
    let rt = small_runtime(2)?;
    let started = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let started = started.clone();
        rt.task(move || {
            started.fetch_add(1, Ordering::SeqCst);
            loop {
                yield_now(0).unwrap();
            }
        })
        .submit()?;
    }

    // Let the workers get a few of them spinning first.
    while started.load(Ordering::SeqCst) == 0 {
        std::thread::yield_now();
    }
    rt.cancel();
    rt.task_complete(true)?;
    assert_eq!(rt.stats().tasks_in_flight, 0);
    Ok(())
}

#[test]
fn submitting_during_cancellation_drops_the_task() -> Result<()> {
    let rt = small_runtime(2)?;
    rt.cancel();
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    // Accepted but dropped.
    rt.task(move || r.store(true, Ordering::SeqCst)).submit()?;
    let tr = rt.task(|| {}).submit_with_ref()?;
    assert!(tr.is_none());
    rt.task_complete(true)?;
    assert!(!ran.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn yield_from_inline_task_is_invalid() -> Result<()> {
    let rt = small_runtime(2)?;
    let got_inval = Arc::new(AtomicBool::new(false));

    let flag = got_inval.clone();
    rt.task(move || {
        let err = yield_now(1).unwrap_err();
        flag.store(matches!(err, TaskError::Inval(_)), Ordering::SeqCst);
    })
    .flags(TaskFlags::NOYIELD)
    .submit()?;

    rt.task_complete(true)?;
    assert!(got_inval.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn immediate_task_runs_at_submission() -> Result<()> {
    let rt = small_runtime(2)?;
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    rt.task(move || r.store(true, Ordering::SeqCst))
        .priority(Priority::Inline)
        .submit()?;
    // No completion call needed: inline-immediate ran on this thread.
    assert!(ran.load(Ordering::SeqCst));
    rt.task_complete(true)?;
    Ok(())
}

#[test]
fn task_wait_blocks_until_finished() -> Result<()> {
    let rt = small_runtime(2)?;
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let tr = rt
        .task(move || {
            std::thread::sleep(Duration::from_millis(5));
            r.store(true, Ordering::SeqCst);
        })
        .submit_with_ref()?
        .expect("no cancellation active");
    rt.task_wait(tr)?;
    assert!(ran.load(Ordering::SeqCst));
    rt.task_complete(true)?;
    Ok(())
}

#[test]
fn task_test_makes_progress_with_a_single_worker() -> Result<()> {
    let rt = small_runtime(1)?;
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let mut tr = rt
        .task(move || r.store(true, Ordering::SeqCst))
        .submit_with_ref()?;

    let mut polls = 0;
    while !rt.task_test(&mut tr)? {
        polls += 1;
        assert!(polls < 100, "task_test made no progress");
    }
    assert!(tr.is_none());
    assert!(ran.load(Ordering::SeqCst));
    rt.task_complete(true)?;
    Ok(())
}

#[test]
fn nested_tasks_join_their_children() -> Result<()> {
    let rt = small_runtime(2)?;
    let children_done = Arc::new(AtomicUsize::new(0));

    let done = children_done.clone();
    let parent = rt
        .task(move || {
            for _ in 0..3 {
                let done = done.clone();
                taskmesh::spawn(move || {
                    std::thread::sleep(Duration::from_millis(2));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
            // Returning here does not complete the parent: children are
            // joined implicitly first.
        })
        .submit_with_ref()?
        .expect("no cancellation active");

    rt.task_wait(parent)?;
    assert_eq!(children_done.load(Ordering::SeqCst), 3);
    rt.task_complete(true)?;
    Ok(())
}

#[test]
fn local_copyin_prefetches_segment_bytes() -> Result<()> {
    init_tracing();
    let fabric = LoopbackFabric::new(1);
    let ep = fabric.endpoint(0);
    ep.register_segment(SegmentId(1), 4096);
    let pattern: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    ep.write_segment(SegmentId(1), 0, &pattern);

    let rt = Runtime::builder()
        .worker_threads(2)
        .task_stack_size(64 << 10)
        .build(ep.clone())?;

    let ok = Arc::new(AtomicBool::new(false));
    let (flag, expect) = (ok.clone(), pattern.clone());
    let src = rt.global_ptr(SegmentId(1), 0);
    rt.task(move || {
        let ptr = taskmesh::copyin_ptr(0).expect("copy-in buffer missing");
        let got = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), expect.len()) };
        flag.store(got == expect.as_slice(), Ordering::SeqCst);
    })
    .depends_on(TaskDep::copyin(src, pattern.len()))
    .submit()?;

    rt.task_complete(true)?;
    assert!(ok.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn direct_dependency_orders_two_tasks() -> Result<()> {
    let rt = small_runtime(2)?;
    let first_done = Arc::new(AtomicBool::new(false));
    let ordered = Arc::new(AtomicBool::new(false));

    let done = first_done.clone();
    let pred = rt
        .task(move || {
            std::thread::sleep(Duration::from_millis(5));
            done.store(true, Ordering::SeqCst);
        })
        .submit_with_ref()?
        .expect("no cancellation active");

    let (done, saw) = (first_done.clone(), ordered.clone());
    rt.task(move || {
        saw.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
    })
    .depends_on(TaskDep::direct(&pred))
    .submit()?;

    rt.taskref_free(pred)?;
    rt.task_complete(true)?;
    assert!(ordered.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn phases_do_not_defer_on_a_single_unit() -> Result<()> {
    let rt = small_runtime(2)?;
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let c = counter.clone();
        rt.task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .submit()?;
        rt.phase_advance();
    }
    assert_eq!(rt.phase_current(), 3);
    rt.task_complete(true)?;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    // The phase counter resets once the root epoch closes.
    assert_eq!(rt.phase_current(), 0);
    Ok(())
}
