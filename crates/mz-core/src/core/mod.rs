pub mod config;
pub(crate) mod fs;
pub mod lifecycle;
pub mod materializer;
pub mod store;
pub mod tooling;
