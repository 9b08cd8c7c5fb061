//! Process exit codes. Part of the CLI contract; CI pipelines branch on them.

pub const GATE_PASS: i32 = 0;
pub const GATE_FAIL: i32 = 1; // Run completed and the gate verdict is fail
pub const CONFIG_ERROR: i32 = 2; // Bad gate file or flags, failed run, internal error
pub const THROTTLED: i32 = 3; // Admission denied by the rate limiter
pub const CANCELLED: i32 = 4; // Interrupted before the gate could be decided
