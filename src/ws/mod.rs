pub mod handler;
pub mod token;
