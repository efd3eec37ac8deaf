pub mod constants;
pub mod handlers;
pub mod service;
