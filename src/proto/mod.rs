pub mod command;
pub mod decoder;
pub mod reply;
