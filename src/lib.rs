pub mod app;
pub mod app_config;
pub mod checkpoint;
pub mod error;
pub mod time_util;
