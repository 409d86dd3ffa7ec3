pub mod api;
pub mod archive;
pub mod assets;
pub mod config;
pub mod discovery;
pub mod distribution;
pub mod mirror;
pub mod pending;
pub mod producer;
pub mod protocol;
pub mod reporter;
pub mod session;
pub mod shutdown;
pub mod sync;
