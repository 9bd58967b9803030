pub mod error;
pub mod handoff;
pub(crate) mod poller;
pub mod recovery;
#[allow(clippy::module_inception)]
pub mod runner;
pub(crate) mod worker;
