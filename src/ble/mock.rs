//! In-memory radio transport for tests.
//!
//! Records every call and can be told to reject operations, which exercises
//! the same paths a radio that refuses a request would.

use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::events::RadioOperation;
use crate::ble::transport::{RadioCommand, RadioTransport};
use crate::error::{Error, Result};
use crate::protocol::WriteRequest;

/// A call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// Scan started with the given service filter.
    StartScan(Vec<Uuid>),
    /// Scan stopped.
    StopScan,
    /// Per-device command.
    Command(RadioCommand),
}

/// Recording transport.
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    failing: Mutex<HashSet<RadioOperation>>,
    fail_scan: Mutex<bool>,
}

impl MockTransport {
    /// Create a transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every future request of this kind.
    pub fn fail(&self, operation: RadioOperation) {
        self.failing.lock().insert(operation);
    }

    /// Reject scan start and stop requests.
    pub fn fail_scans(&self, fail: bool) {
        *self.fail_scan.lock() = fail;
    }

    /// Accept everything again.
    pub fn clear_failures(&self) {
        self.failing.lock().clear();
        *self.fail_scan.lock() = false;
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Recorded per-device commands, oldest first.
    pub fn commands(&self) -> Vec<RadioCommand> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Command(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Drain the recorded calls.
    pub fn take_calls(&self) -> Vec<TransportCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn record_command(&self, command: RadioCommand) -> Result<()> {
        let operation = command.operation();
        self.calls.lock().push(TransportCall::Command(command));
        if self.failing.lock().contains(&operation) {
            return Err(Error::ConnectionFailed {
                reason: format!("mock {} rejected", operation),
            });
        }
        Ok(())
    }

    fn record_scan(&self, call: TransportCall) -> Result<()> {
        self.calls.lock().push(call);
        if *self.fail_scan.lock() {
            return Err(Error::BluetoothUnavailable);
        }
        Ok(())
    }
}

impl RadioTransport for MockTransport {
    fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.record_scan(TransportCall::StartScan(services.to_vec()))
    }

    fn stop_scan(&self) -> Result<()> {
        self.record_scan(TransportCall::StopScan)
    }

    fn connect(&self, address: &DeviceAddress) -> Result<()> {
        self.record_command(RadioCommand::Connect(*address))
    }

    fn disconnect(&self, address: &DeviceAddress) -> Result<()> {
        self.record_command(RadioCommand::Disconnect(*address))
    }

    fn discover_services(&self, address: &DeviceAddress, services: &[Uuid]) -> Result<()> {
        self.record_command(RadioCommand::DiscoverServices {
            address: *address,
            services: services.to_vec(),
        })
    }

    fn discover_characteristics(
        &self,
        address: &DeviceAddress,
        service: &Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        self.record_command(RadioCommand::DiscoverCharacteristics {
            address: *address,
            service: *service,
            characteristics: characteristics.to_vec(),
        })
    }

    fn write(&self, address: &DeviceAddress, request: &WriteRequest) -> Result<()> {
        self.record_command(RadioCommand::Write {
            address: *address,
            request: request.clone(),
        })
    }

    fn read(&self, address: &DeviceAddress, service: &Uuid, characteristic: &Uuid) -> Result<()> {
        self.record_command(RadioCommand::Read {
            address: *address,
            service: *service,
            characteristic: *characteristic,
        })
    }

    fn subscribe(
        &self,
        address: &DeviceAddress,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Result<()> {
        self.record_command(RadioCommand::Subscribe {
            address: *address,
            service: *service,
            characteristic: *characteristic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_calls() {
        let transport = MockTransport::new();
        let address = DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        transport.start_scan(&[]).unwrap();
        transport.connect(&address).unwrap();
        transport.stop_scan().unwrap();

        assert_eq!(
            transport.take_calls(),
            vec![
                TransportCall::StartScan(vec![]),
                TransportCall::Command(RadioCommand::Connect(address)),
                TransportCall::StopScan,
            ]
        );
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_injected_failure() {
        let transport = MockTransport::new();
        let address = DeviceAddress::new([1, 2, 3, 4, 5, 6]);

        transport.fail(RadioOperation::Connect);
        assert!(transport.connect(&address).is_err());
        assert!(transport.disconnect(&address).is_ok());
        assert_eq!(transport.commands().len(), 2);

        transport.fail_scans(true);
        assert!(matches!(
            transport.start_scan(&[]),
            Err(Error::BluetoothUnavailable)
        ));

        transport.clear_failures();
        assert!(transport.connect(&address).is_ok());
        assert!(transport.start_scan(&[]).is_ok());
    }
}
