pub mod config;
pub mod logger;
pub mod model;
pub mod error;
pub mod state;
pub mod upstream;
pub mod downstream;
pub mod rest;
