//! taskmesh — a PGAS-style task-parallel runtime.
//!
//! Tasks carry dataflow dependencies over globally addressable memory. Per
//! process, a fixed pool of workers executes them with per-thread hot
//! slots, shared per-NUMA two-priority queues and work stealing; tasks may
//! suspend cooperatively on pooled, guard-paged stacks. Dependencies whose
//! producer lives on another unit are satisfied through an active-message
//! engine on top of a pluggable one-sided [`Transport`], with phase-scoped
//! collective matching, and `Copyin` dependencies prefetch remote bytes
//! into pooled buffers before the consumer runs.
//!
//! ```no_run
//! use taskmesh::{Runtime, TaskDep};
//!
//! let rt = Runtime::local()?;
//! let key = rt.local_ptr(0x1000);
//!
//! rt.task(|| println!("producer"))
//!     .depends_on(TaskDep::output(key))
//!     .submit()?;
//! rt.task(|| println!("consumer"))
//!     .depends_on(TaskDep::input(key))
//!     .submit()?;
//!
//! rt.task_complete(true)?;
//! # Ok::<(), taskmesh::TaskError>(())
//! ```

mod context;
mod copyin;
pub mod dep;
mod error;
mod remote;
pub mod runtime;
mod sched;
pub mod task;
pub mod transport;
mod util;

pub use copyin::{CopyinImpl, CopyinWait};
pub use dep::{DepType, GlobalPtr, Phase, SegmentId, TaskDep, UnitId, PHASE_FIRST};
pub use error::{Result, TaskError};
pub use runtime::{Builder, Runtime, TaskBuilder};
pub use sched::idle::IdleMethod;
pub use sched::ops::{copyin_ptr, in_task, spawn, yield_now};
pub use sched::RuntimeStats;
pub use task::{Priority, TaskFlags, TaskId, TaskRef, TaskState};
pub use transport::loopback::{LoopbackFabric, LoopbackTransport};
pub use transport::{CountsExchange, Tag, TransferHandle, Transport};
