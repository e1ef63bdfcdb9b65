pub mod commands;
pub mod err;
