pub mod access;
pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod migrate;
pub mod model;
pub mod mongo_ext;
pub mod store;
pub mod util;
