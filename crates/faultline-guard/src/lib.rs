//! # faultline-guard
//!
//! Fault interception and unchecked runtime primitives.
//!
//! - [`signal`]: process-wide handlers for the covered crash signals and the
//!   per-thread guard stacks they resume into.
//! - [`region`]: handler registration lifecycle across supervised calls, and
//!   suspension of third-party fault reporters.
//! - [`supervisor`]: [`handle`], [`supervise`] and [`guarded`].
//! - [`primitives`]: lifetime-count, attribute and frame-local manipulation
//!   that bypasses the object model's own rules.
//! - [`stack`]: callbacks over stack-allocated scratch buffers.
//! - [`heap`]: `malloc`-family blocks that refuse use after free.
//! - [`probes`]: deliberate faults for tests and the harness.

pub mod heap;
pub mod primitives;
pub mod probes;
pub mod region;
pub mod signal;
pub mod stack;
pub mod supervisor;

pub use heap::HeapBuffer;
pub use primitives::{add_ref, force_set_attr, force_update_locals, remove_ref, set_ref};
pub use region::{FaultReporter, init, register_reporter, unregister_reporter};
pub use stack::{StackBuffer, StackWrapper, run_stack_callback};
pub use supervisor::{guarded, handle, supervise};
