pub mod audit_logger;
pub mod remote_path;
