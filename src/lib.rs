pub mod actors;
pub mod batch;
pub mod circuit_breaker;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod guard;
pub mod node;
pub mod parsers;
pub mod scheduler;
pub mod storage;
