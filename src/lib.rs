pub mod data;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod settings;
pub mod utils;
