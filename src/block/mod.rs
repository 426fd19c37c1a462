//! Block-level primitives: the pure alignment function and the dirty-block
//! state machine it feeds.

pub mod align;
pub mod dirty;

pub use align::{aligned, Alignment};
pub use dirty::{BlockFlags, BlockState, DirtyBlock};
