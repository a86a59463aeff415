//! Process exit codes shared by `warden` and `warden-watchdog`

pub const OK: i32 = 0;
pub const FAILURE: i32 = 1;
pub const CONFIG_INVALID: i32 = 2;
pub const ALREADY_RUNNING: i32 = 3;
pub const ESCALATION_REQUIRED: i32 = 4;
pub const PERSISTENCE_FAILURE: i32 = 5;
