// Atomics used by the counter. Under `--cfg shuttle` they are swapped for
// shuttle's so that the scheduler can explore interleavings of increments
// and decrements.

#[cfg(not(shuttle))]
pub use std::sync;

#[cfg(shuttle)]
pub use shuttle::sync;
