pub const SUCCESS: i32 = 0;
/// Bad arguments, unreadable or invalid configuration
pub const INPUT_ERROR: i32 = 2;
/// Failure while running the pipeline or writing output
pub const EXECUTION_ERROR: i32 = 3;
