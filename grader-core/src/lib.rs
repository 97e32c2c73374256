/// Toolchain adapter turning a submission directory into a runnable artifact
pub mod compiler;
pub mod error;
/// Test case model, validators, verdicts and single job orchestration
pub mod judge;
/// Runtime essentials for running a program under control
pub mod run;
pub mod utils;
