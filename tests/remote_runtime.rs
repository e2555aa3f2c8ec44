//! Multi-unit scenarios over the loopback fabric: cross-process RAW
//! dependencies, phase matching and the copy-in engine. Every "process" is
//! a thread owning one endpoint and one runtime.

use anyhow::Result;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use taskmesh::{
    CopyinImpl, CopyinWait, Builder, GlobalPtr, LoopbackFabric, LoopbackTransport, Runtime,
    SegmentId, TaskDep, Transport, UnitId,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_builder() -> Builder {
    Runtime::builder().worker_threads(2).task_stack_size(64 << 10)
}

/// Run one closure per unit, each on its own thread with its endpoint.
fn run_units<F>(num_units: usize, f: F) -> Result<()>
where
    F: Fn(usize, Arc<LoopbackTransport>) -> Result<()> + Send + Sync + 'static,
{
    init_tracing();
    let fabric = LoopbackFabric::new(num_units);
    let f = Arc::new(f);
    let handles: Vec<_> = fabric
        .endpoints()
        .into_iter()
        .enumerate()
        .map(|(rank, ep)| {
            let f = f.clone();
            std::thread::Builder::new()
                .name(format!("unit-{rank}"))
                .spawn(move || f(rank, ep))
                .expect("failed to spawn unit thread")
        })
        .collect();
    for h in handles {
        h.join().expect("unit thread panicked")?;
    }
    Ok(())
}

const DATA_SEG: SegmentId = SegmentId(1);

#[test]
fn cross_process_raw_dependency() -> Result<()> {
    run_units(2, |rank, ep| {
        ep.register_segment(DATA_SEG, 4096);
        let rt = small_builder().build(ep.clone())?;
        let x = GlobalPtr::new(UnitId(0), DATA_SEG, 0);

        if rank == 0 {
            let writer = ep.clone();
            rt.task(move || {
                writer.write_segment(DATA_SEG, 0, &0xDEAD_1234u32.to_le_bytes());
            })
            .depends_on(TaskDep::output(x))
            .describe("remote producer")
            .submit()?;
        } else {
            let reader = ep.clone();
            let ok = Arc::new(AtomicBool::new(false));
            let flag = ok.clone();
            rt.task(move || {
                let mut buf = [0u8; 4];
                let h = unsafe {
                    reader
                        .get_into(x, NonNull::new(buf.as_mut_ptr()).unwrap(), 4)
                        .unwrap()
                };
                assert!(h.is_complete());
                flag.store(u32::from_le_bytes(buf) == 0xDEAD_1234, Ordering::SeqCst);
            })
            .depends_on(TaskDep::input(x))
            .describe("remote consumer")
            .submit()?;

            rt.task_complete(false)?;
            assert!(ok.load(Ordering::SeqCst), "consumer read a stale value");
            return Ok(());
        }

        rt.task_complete(false)?;
        Ok(())
    })
}

fn copyin_scenario(impl_kind: CopyinImpl, wait: CopyinWait) -> Result<()> {
    run_units(2, move |rank, ep| {
        ep.register_segment(DATA_SEG, 4096);
        let rt = small_builder()
            .copyin_impl(impl_kind)
            .copyin_wait(wait)
            .build(ep.clone())?;
        let x = GlobalPtr::new(UnitId(0), DATA_SEG, 0);
        let pattern: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 256) as u8).collect();

        if rank == 0 {
            let writer = ep.clone();
            let data = pattern.clone();
            rt.task(move || {
                writer.write_segment(DATA_SEG, 0, &data);
            })
            .depends_on(TaskDep::output(x))
            .submit()?;
            rt.task_complete(false)?;
        } else {
            let ok = Arc::new(AtomicBool::new(false));
            let (flag, expect) = (ok.clone(), pattern.clone());
            rt.task(move || {
                let ptr = taskmesh::copyin_ptr(0).expect("copy-in buffer missing");
                let got = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), expect.len()) };
                flag.store(got == expect.as_slice(), Ordering::SeqCst);
            })
            .depends_on(TaskDep::copyin(x, pattern.len()))
            .submit()?;
            rt.task_complete(false)?;
            assert!(ok.load(Ordering::SeqCst), "copy-in delivered wrong bytes");
        }
        Ok(())
    })
}

#[test]
fn copyin_get_delivers_remote_bytes() -> Result<()> {
    copyin_scenario(CopyinImpl::Get, CopyinWait::DetachInline)
}

#[test]
fn copyin_get_with_blocking_wait() -> Result<()> {
    copyin_scenario(CopyinImpl::Get, CopyinWait::Block)
}

#[test]
fn copyin_sendrecv_delivers_remote_bytes() -> Result<()> {
    copyin_scenario(CopyinImpl::Sendrecv, CopyinWait::Block)
}

#[test]
fn copyin_sendrecv_with_yield_wait() -> Result<()> {
    copyin_scenario(CopyinImpl::Sendrecv, CopyinWait::Yield)
}

#[test]
fn later_phase_reader_defers_until_matching() -> Result<()> {
    run_units(2, |rank, ep| {
        ep.register_segment(DATA_SEG, 4096);
        let rt = small_builder().build(ep.clone())?;
        let x = GlobalPtr::new(UnitId(0), DATA_SEG, 0);

        if rank == 0 {
            let writer = ep.clone();
            rt.task(move || {
                writer.write_segment(DATA_SEG, 0, &777u32.to_le_bytes());
            })
            .depends_on(TaskDep::output(x))
            .submit()?;
            rt.phase_advance();
        } else {
            rt.phase_advance();
            // Submitted in phase 1: deferred locally until matching
            // declares the phase runnable.
            let reader = ep.clone();
            let ok = Arc::new(AtomicBool::new(false));
            let flag = ok.clone();
            rt.task(move || {
                let mut buf = [0u8; 4];
                unsafe {
                    reader
                        .get_into(x, NonNull::new(buf.as_mut_ptr()).unwrap(), 4)
                        .unwrap()
                };
                flag.store(u32::from_le_bytes(buf) == 777, Ordering::SeqCst);
            })
            .depends_on(TaskDep::input(x).at_phase(0))
            .submit()?;

            rt.task_complete(false)?;
            assert!(ok.load(Ordering::SeqCst));
            return Ok(());
        }
        rt.task_complete(false)?;
        Ok(())
    })
}

#[test]
fn collective_completion_without_tasks_aligns() -> Result<()> {
    run_units(3, |_rank, ep| {
        let rt = small_builder().build(ep)?;
        // Two empty collective epochs; all units must pass both barriers.
        rt.task_complete(false)?;
        rt.task_complete(false)?;
        Ok(())
    })
}

#[test]
fn reader_with_no_writer_is_released_at_matching() -> Result<()> {
    run_units(2, |rank, ep| {
        ep.register_segment(DATA_SEG, 4096);
        let rt = small_builder().build(ep.clone())?;
        let x = GlobalPtr::new(UnitId(0), DATA_SEG, 128);

        if rank == 1 {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = ran.clone();
            // Nobody ever writes x: the dependency resolves at matching.
            rt.task(move || flag.store(true, Ordering::SeqCst))
                .depends_on(TaskDep::input(x))
                .submit()?;
            rt.task_complete(false)?;
            assert!(ran.load(Ordering::SeqCst));
            return Ok(());
        }
        rt.task_complete(false)?;
        Ok(())
    })
}
