// Library module for the pipeline and its ambient setup

pub mod config;
pub mod logging;
pub mod pipeline;
