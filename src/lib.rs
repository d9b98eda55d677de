// Public API - run configuration, engine and exported data types
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod logging;
pub mod probe;
pub mod responder;
pub mod state;

// Argument parsing, shared by both binaries
pub mod cli;
