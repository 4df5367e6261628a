pub mod config;
pub mod lib;
