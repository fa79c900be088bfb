pub mod controller;
pub mod dds_ops;
pub mod engine;
pub mod error;
pub mod history;
pub mod restore;
pub mod session;
pub mod submit;


pub use controller::{Controller, TRIGGER_WHITELIST};
pub use error::ControllerError;
pub use restore::{smart_path, RestoreData, RestoreFile, RestorePartition};
pub use session::{Session, SessionStore};
