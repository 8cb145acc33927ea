//! Signal bridge
//!
//! Moves asynchronous signal delivery into ordinary task context through a
//! self-pipe, so signal reactions run as normal tasks.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("baton-runtime only supports unix targets");
    }
}
