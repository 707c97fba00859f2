#![forbid(unsafe_code)]

pub mod config;
pub mod correlation;
pub mod error;
pub mod forward;
pub mod image_dir;
pub mod media_fetch;
pub mod telegram;
