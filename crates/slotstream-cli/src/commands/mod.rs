mod drop_slot;
mod run;
mod status;

pub use drop_slot::cmd_drop_slot;
pub use run::{cmd_run, RunOverrides};
pub use status::cmd_status;
