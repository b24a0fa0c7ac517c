pub mod archive;
pub mod config;
pub mod deploy;
pub mod error;
pub mod image_reference;
pub mod image_store;
pub mod reconcile;
pub mod retry;
pub mod runner;
pub mod secret_string;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
