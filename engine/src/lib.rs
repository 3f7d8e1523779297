//! Courier Engine Library
//!
//! This library provides the coordinator, worker and bus broker roles of
//! Courier. It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Secret management module
pub mod secrets;

/// Message bus for inter-process communication
pub mod message_bus;

/// Analysis provider abstraction layer
pub mod llm;

/// Conversation front end (Telegram)
pub mod bot;

/// Task classification, dispatch and correlation
pub mod coordinator;

/// Capability worker runtime
pub mod worker;

/// Telemetry and Observability
pub mod telemetry;

/// Process lifecycle and shutdown
pub mod daemon;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
