pub mod filesystem_tool;
pub mod session_tool;
pub mod terminal_tool;
