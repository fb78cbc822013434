pub mod agent;
pub mod driver;
pub mod error;
pub mod reconcile;
pub mod resource;
pub mod service;
pub mod settings;
pub mod shell;
pub mod store;
pub mod tunnel;

pub use error::{Result, TetherError};
