#[allow(clippy::module_inception)]
pub mod queue;
pub mod redis;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
