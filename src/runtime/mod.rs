pub(crate) mod builder;
#[allow(clippy::module_inception)]
pub(crate) mod runtime;

pub use builder::Builder;
pub(crate) use builder::RuntimeConfig;
pub use runtime::{Runtime, TaskBuilder};
