pub mod artifacts;
pub mod catalog;
pub mod collector;
pub mod command;
pub mod config;
pub mod executors;
pub mod job;
pub mod layout;
pub mod pipeline;
pub mod planner;
pub mod retry;
pub mod templates;
pub mod worker;
