#![forbid(unsafe_code)]

pub mod abstract_file;
pub mod abstract_plan;
pub mod chapter_count;
pub mod cli;
pub mod config;
pub mod gemini;
pub mod logging;
pub mod pricing;
pub mod story;
pub mod usage;
