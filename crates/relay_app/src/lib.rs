//! Headless host for the relay engine: configuration, card persistence and
//! a replay driver that feeds a recorded session through the engine.
pub mod config;
pub mod persistence;
pub mod replay;
