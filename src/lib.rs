pub mod config;
pub mod docx;
pub mod error;
pub mod progress;
