pub mod loader;
pub mod models;

pub use loader::{load_config, parse_config};
pub use models::*;
