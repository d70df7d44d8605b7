pub mod handler;
pub mod schemas;
