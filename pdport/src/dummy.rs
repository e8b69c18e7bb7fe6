//! Implements dummy drivers, timers and device policy managers for testing.
use std::future::pending;
use std::vec::Vec;

use pdport_traits::{DataRole, Driver, DriverRxError, DriverTxError, PowerRole};

use crate::protocol_layer::message::data::request::{PowerSourceRequest, SinkPowerPreferences};
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, PowerDataObject, SourceCapabilities};
use crate::sink::device_policy_manager::DevicePolicyManager as SinkDevicePolicyManager;
use crate::source::device_policy_manager::DevicePolicyManager as SourceDevicePolicyManager;
use crate::timers::Timer;

/// The maximum message size that the dummy driver handles.
pub const MAX_DATA_MESSAGE_SIZE: usize = 30;

/// A sink device that evaluates capabilities against power preferences.
pub struct DummyPreferenceSinkDevice {
    pub preferences: SinkPowerPreferences,
}

impl SinkDevicePolicyManager for DummyPreferenceSinkDevice {
    async fn request(&mut self, source_capabilities: &SourceCapabilities) -> PowerSourceRequest {
        PowerSourceRequest::evaluate_capabilities(&self.preferences, source_capabilities).unwrap()
    }
}

/// A sink device that accepts power role swaps.
pub struct DummySwapSinkDevice {}

impl SinkDevicePolicyManager for DummySwapSinkDevice {
    async fn accept_power_role_swap(&mut self) -> bool {
        true
    }
}

/// A dummy source device that advertises a 5 V / 3 A and a 9 V / 2 A supply.
#[derive(Default)]
pub struct DummySourceDevice {
    /// The contract that the device was last asked to transition to.
    pub last_contract: Option<crate::Contract>,
}

impl SourceDevicePolicyManager for DummySourceDevice {
    fn source_capabilities(&mut self) -> SourceCapabilities {
        SourceCapabilities::new(&get_dummy_source_capabilities())
    }

    async fn transition_supply(&mut self, contract: &crate::Contract) {
        self.last_contract = Some(*contract);
    }
}

/// A dummy timer that never fires.
pub struct DummyTimer {}

impl Timer for DummyTimer {
    async fn after_millis(_milliseconds: u64) {
        // Never time out
        pending().await
    }
}

/// A timer that fires after yielding once.
///
/// Receive futures with pending data win the race against this timer, while
/// empty receives time out on the next poll.
pub struct YieldingTimer {}

impl Timer for YieldingTimer {
    async fn after_millis(_milliseconds: u64) {
        embassy_futures::yield_now().await
    }
}

/// A dummy driver for testing.
///
/// Received data is injected ahead of time and handed out in order; an empty
/// receive queue pends forever. Transmitted data can be probed.
pub struct DummyDriver<const N: usize> {
    rx_vec: Vec<heapless::Vec<u8, N>>,
    tx_vec: Vec<heapless::Vec<u8, N>>,
    /// The number of transmitted hard reset signals.
    pub hard_reset_count: usize,
    /// The most recently asserted power role, if any.
    pub power_role: Option<PowerRole>,
    /// The most recently asserted data role, if any.
    pub data_role: Option<DataRole>,
    /// The most recent VCONN supply state, if any.
    pub vconn: Option<bool>,
}

impl<const N: usize> DummyDriver<N> {
    /// Create a new dummy driver.
    pub fn new() -> Self {
        Self {
            rx_vec: Vec::new(),
            tx_vec: Vec::new(),
            hard_reset_count: 0,
            power_role: None,
            data_role: None,
            vconn: None,
        }
    }

    /// Inject received data that can be retrieved later.
    pub fn inject_received_data(&mut self, data: &[u8]) {
        let mut vec = heapless::Vec::new();
        vec.extend_from_slice(data).unwrap();

        self.rx_vec.push(vec);
    }

    /// Probe data that was transmitted by the stack.
    pub fn probe_transmitted_data(&mut self) -> heapless::Vec<u8, N> {
        self.tx_vec.remove(0)
    }

    /// Whether transmitted data is available for probing.
    pub fn has_transmitted_data(&self) -> bool {
        !self.tx_vec.is_empty()
    }
}

impl<const N: usize> Driver for DummyDriver<N> {
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, DriverRxError> {
        if self.rx_vec.is_empty() {
            // Nothing on the wire.
            pending::<()>().await;
        }

        let first = self.rx_vec.remove(0);
        let len = first.len();
        buffer[..len].copy_from_slice(&first);

        Ok(len)
    }

    async fn transmit(&mut self, data: &[u8]) -> Result<(), DriverTxError> {
        let mut vec = heapless::Vec::new();
        vec.extend_from_slice(data).unwrap();
        self.tx_vec.push(vec);

        Ok(())
    }

    async fn transmit_hard_reset(&mut self) -> Result<(), DriverTxError> {
        self.hard_reset_count += 1;
        Ok(())
    }

    async fn wait_for_vbus(&self) {
        // Do nothing.
    }

    async fn set_power_role(&mut self, role: PowerRole) {
        self.power_role = Some(role);
    }

    async fn set_data_role(&mut self, role: DataRole) {
        self.data_role = Some(role);
    }

    async fn set_vconn(&mut self, enabled: bool) {
        self.vconn = Some(enabled);
    }
}

/// Dummy capabilities to deserialize.
///
/// - Fixed 5 V at 3 A, dual-role power and data
/// - Fixed 9 V at 2 A
pub const DUMMY_CAPABILITIES: [u8; 10] = [
    0xA1, // Header
    0x21, // Header
    0x2C, // +
    0x91, // | Fixed 5V @ 3A
    0x01, // |
    0x22, // +
    0xC8, // +
    0xD0, // | Fixed 9V @ 2A
    0x02, // |
    0x00, // +
];

/// Get dummy source capabilities for testing.
///
/// Corresponds to the `DUMMY_CAPABILITIES` above.
pub fn get_dummy_source_capabilities() -> Vec<PowerDataObject> {
    let mut pdos: Vec<PowerDataObject> = Vec::new();

    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::default()
            .with_raw_voltage(100)
            .with_raw_max_current(300)
            .with_dual_role_power(true)
            .with_dual_role_data(true),
    ));

    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::default().with_raw_voltage(180).with_raw_max_current(200),
    ));

    pdos
}

#[cfg(test)]
mod tests {
    use pdport_traits::Driver;

    use crate::dummy::DummyDriver;

    #[tokio::test]
    async fn test_receive() {
        let mut driver: DummyDriver<30> = DummyDriver::new();

        let mut injected_data = [0u8; 30];
        injected_data[0] = 123;

        driver.inject_received_data(&injected_data);

        injected_data[1] = 255;
        driver.inject_received_data(&injected_data);

        let mut buf = [0u8; 30];
        driver.receive(&mut buf).await.unwrap();

        assert_eq!(buf[0], 123);
        assert_eq!(buf[1], 0);

        let mut buf = [0u8; 30];
        driver.receive(&mut buf).await.unwrap();

        assert_eq!(buf[0], 123);
        assert_eq!(buf[1], 255);
    }

    #[test]
    fn dummy_capability_bytes_match_objects() {
        use byteorder::{ByteOrder, LittleEndian};

        for (index, pdo) in super::get_dummy_source_capabilities().iter().enumerate() {
            let raw = LittleEndian::read_u32(&super::DUMMY_CAPABILITIES[2 + 4 * index..]);
            assert_eq!(raw, pdo.to_raw());
        }
    }
}
