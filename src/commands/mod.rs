// ABOUTME: Command implementations for the tosh-sync CLI
// ABOUTME: Exports run, once, status, dead-letters and check commands

pub mod check;
pub mod dead_letters;
pub mod once;
pub mod run;
pub mod status;

pub use check::check;
pub use once::once;
pub use run::run;
pub use status::status;

/// Exit code for a command that completed but found problems.
pub const EXIT_PROBLEMS: i32 = 1;

/// Exit code for `check` when the destination cannot be reached.
pub const EXIT_DESTINATION_UNREACHABLE: i32 = 2;
