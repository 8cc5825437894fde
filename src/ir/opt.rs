//! SSA optimizations

mod dce;
mod demote;
mod fold;

pub use dce::kill_dead_values;
pub use demote::demote_globals;
pub use fold::fold_constants;
