//! Nimbus Edge Agent
//!
//! Keeps an embedded device in coherent two-way synchronization with its
//! cloud control plane: device lifecycle (serialize, register, claim,
//! provision, connect), an MQTT session with scheduled reconnection,
//! bidirectional database sync with crash recovery, cloud log capture,
//! and remote command processing.

pub mod commands;
pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod logs;
pub mod mqtt;
pub mod provision;
pub mod schedule;
pub mod shadow;
pub mod signer;
pub mod sync;
pub mod update;

/// Ceiling for a single MQTT message
pub const MESSAGE_SIZE: usize = 128 * 1024;

/// Process lifecycle requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Run,
    Restart,
    Stop,
}
