pub mod config;
pub mod device;
pub mod error;
pub mod mcp;
pub mod tools;
pub mod utils;
