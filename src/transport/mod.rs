//! Transport capability consumed by the deployment engine.
//!
//! The engine never owns a session. Every workflow receives a
//! `&dyn ScriptTransport` per call, so a simulated transport can stand in for a
//! live instrument in tests.
//!
//! ## Command Ordering
//! - Calls are awaited one at a time; the engine issues no concurrent requests
//! - Access to one node must be serialized by the caller
//! - Timeouts and retries belong to the implementation
//!
//! ## Status Byte
//! Only the error-available bit is interpreted by the engine; the remaining bits
//! are surfaced for diagnostics.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bitflags::bitflags;

pub mod commands;
pub mod mock;

pub use mock::{SimulatedScript, SimulatedTransport};

bitflags! {
    /// TSP status byte (`status.condition`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusByte: u8 {
        /// Measurement event summary.
        const MEASUREMENT = 0x01;
        /// System event summary.
        const SYSTEM = 0x02;
        /// Error queue is not empty.
        const ERROR_AVAILABLE = 0x04;
        /// Questionable event summary.
        const QUESTIONABLE = 0x08;
        /// Output queue holds a message.
        const MESSAGE_AVAILABLE = 0x10;
        /// Standard event summary.
        const EVENT_SUMMARY = 0x20;
        /// Master summary status.
        const MASTER_SUMMARY = 0x40;
        /// Operation event summary.
        const OPERATION = 0x80;
    }
}

/// Delays used to pace successive transport calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportPacing {
    /// Pause after commands that change the script catalog.
    pub command_delay: Duration,
    /// Pause between lines of an uploaded script.
    pub line_delay: Duration,
}

impl TransportPacing {
    /// Pacing from millisecond settings.
    pub fn from_millis(command_delay_ms: u64, line_delay_ms: u64) -> Self {
        Self {
            command_delay: Duration::from_millis(command_delay_ms),
            line_delay: Duration::from_millis(line_delay_ms),
        }
    }
}

/// Session with the controller node of an instrument network.
#[async_trait]
pub trait ScriptTransport: Send + Sync {
    /// Send one line without reading a reply.
    ///
    /// # Errors
    /// - Hardware communication error
    async fn write_line(&self, command: &str) -> Result<()>;

    /// Evaluate an expression that prints a value and return the trimmed reply.
    ///
    /// # Errors
    /// - Hardware communication error
    /// - Timeout (implementation-dependent)
    async fn query_print_value(&self, expression: &str) -> Result<String>;

    /// Return true when `name` resolves to nil on the instrument.
    async fn is_nil(&self, name: &str) -> Result<bool>;

    /// Read the status byte.
    async fn read_status_byte(&self) -> Result<StatusByte>;

    /// Delays to apply between successive calls.
    fn pacing(&self) -> TransportPacing {
        TransportPacing::default()
    }
}

/// Reads the next error message when the node reports one.
pub async fn read_device_error(transport: &dyn ScriptTransport) -> Result<Option<String>> {
    let status = transport.read_status_byte().await?;
    if !status.contains(StatusByte::ERROR_AVAILABLE) {
        return Ok(None);
    }
    let message = transport
        .query_print_value(commands::ERROR_QUEUE_QUERY)
        .await?;
    Ok(Some(message))
}

/// Most entries [`drain_device_errors`] reads in one pass.
pub const MAX_DRAINED_ERRORS: usize = 64;

/// Reads the error queue until the node stops reporting errors.
///
/// Stops after [`MAX_DRAINED_ERRORS`] entries so a node that keeps the
/// error-available bit set cannot stall a workflow.
pub async fn drain_device_errors(transport: &dyn ScriptTransport) -> Result<Vec<String>> {
    let mut messages = Vec::new();
    while messages.len() < MAX_DRAINED_ERRORS {
        match read_device_error(transport).await? {
            Some(message) => messages.push(message),
            None => break,
        }
    }
    Ok(messages)
}

/// Waits for the given pause when it is non-zero.
pub(crate) async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_from_millis() {
        let pacing = TransportPacing::from_millis(20, 0);
        assert_eq!(pacing.command_delay, Duration::from_millis(20));
        assert!(pacing.line_delay.is_zero());
    }

    #[tokio::test]
    async fn test_read_device_error() {
        let transport = SimulatedTransport::new(1);
        assert_eq!(read_device_error(&transport).await.unwrap(), None);

        transport.push_error("-285, TSP Syntax error");
        let message = read_device_error(&transport).await.unwrap();
        assert_eq!(message.as_deref(), Some("-285, TSP Syntax error"));
        assert_eq!(read_device_error(&transport).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drain_device_errors_empties_queue() {
        let transport = SimulatedTransport::new(1);
        transport.push_error("-286, first");
        transport.push_error("-286, second");
        let messages = drain_device_errors(&transport).await.unwrap();
        assert_eq!(messages, vec!["-286, first", "-286, second"]);
        assert_eq!(transport.error_count(), 0);
        assert!(drain_device_errors(&transport).await.unwrap().is_empty());
    }
}
