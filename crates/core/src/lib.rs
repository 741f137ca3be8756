//! Domain types and pure logic shared by every `framepipe` crate.
//!
//! Nothing in here touches the checkpoint or cache storage; those live in
//! `framepipe-pipeline`. The only I/O is content hashing and the subprocess
//! helper used to invoke external stage executables.

pub mod error;
pub mod hashing;
pub mod invocation;
pub mod job;
pub mod priority;
pub mod progress;
pub mod resources;
pub mod stages;
pub mod types;
