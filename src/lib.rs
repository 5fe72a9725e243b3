pub mod config;
pub mod core;
pub mod error;
pub mod gateway;
pub mod interfaces;
