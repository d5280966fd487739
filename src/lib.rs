pub mod capture;
pub mod config;
pub mod db;
pub mod era;
pub mod error;
pub mod gallery;
pub mod llm;
pub mod session;
pub mod utils;
pub mod workflow;
