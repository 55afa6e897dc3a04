/// Sandboxed execution of untrusted submissions against test harnesses,
/// with normalization of the produced reports.
pub mod classify;
pub mod diagnostics;
pub mod error;
pub mod junit;
pub mod memcheck;
pub mod report;
pub mod runner;
pub mod sandbox;
pub mod sanitize;
pub mod settings;
pub mod token;
pub mod utils;
pub mod workspace;
