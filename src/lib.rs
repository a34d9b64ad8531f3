pub mod api;
pub mod cli;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod provisioner;
pub mod registrar;
pub mod scheme;
pub mod server;
pub mod signin;
pub mod store;

pub use error::{AppError, AppResult, ErrorKind};
