//! Dual-role port handling.
//!
//! A [`Port`] owns the driver and the device policy manager, and runs the
//! policy engine that matches the port's present power role. When an engine
//! completes a power role swap, it hands driver and policy manager back, and
//! the port resumes operation with the complementary engine.
//!
//! A port is built per attach. On detach, drop the future returned by
//! [`Port::run`] and build a fresh port when the next partner attaches.
use core::marker::PhantomData;

use pdport_traits::Driver;

use crate::sink::device_policy_manager::DevicePolicyManager as SinkDevicePolicyManager;
use crate::sink::policy_engine::{Error as SinkError, Sink};
use crate::source::device_policy_manager::DevicePolicyManager as SourceDevicePolicyManager;
use crate::source::policy_engine::{Error as SourceError, Source};
use crate::timers::Timer;
use crate::{DataRole, Handover, PowerRole};

/// Errors that end the operation of a port.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The sink engine failed.
    Sink(SinkError),
    /// The source engine failed.
    Source(SourceError),
}

/// A dual-role PD port.
///
/// The device policy manager must implement the manager traits of both roles.
pub struct Port<DRIVER, TIMER, DPM>
where
    DRIVER: Driver,
    TIMER: Timer,
    DPM: SinkDevicePolicyManager + SourceDevicePolicyManager,
{
    driver: DRIVER,
    device_policy_manager: DPM,
    power_role: PowerRole,
    data_role: DataRole,
    _timer: PhantomData<TIMER>,
}

impl<DRIVER, TIMER, DPM> Port<DRIVER, TIMER, DPM>
where
    DRIVER: Driver,
    TIMER: Timer,
    DPM: SinkDevicePolicyManager + SourceDevicePolicyManager,
{
    /// Create a port that attached in the sink role (Rd asserted).
    pub fn new_sink(driver: DRIVER, device_policy_manager: DPM) -> Self {
        Self {
            driver,
            device_policy_manager,
            power_role: PowerRole::Sink,
            data_role: DataRole::Ufp,
            _timer: PhantomData,
        }
    }

    /// Create a port that attached in the source role (Rp asserted).
    pub fn new_source(driver: DRIVER, device_policy_manager: DPM) -> Self {
        Self {
            driver,
            device_policy_manager,
            power_role: PowerRole::Source,
            data_role: DataRole::Dfp,
            _timer: PhantomData,
        }
    }

    /// Run the port until an unrecoverable error occurs.
    ///
    /// Alternates between the sink and source engines across power role
    /// swaps. Consumes the port; on detach, drop the returned future and
    /// build a fresh port for the next attach.
    pub async fn run(self) -> Result<(), Error> {
        let mut driver = self.driver;
        let mut device_policy_manager = self.device_policy_manager;
        let mut power_role = self.power_role;
        let mut data_role = self.data_role;
        let mut after_swap = false;

        loop {
            match power_role {
                PowerRole::Sink => {
                    let mut sink: Sink<DRIVER, TIMER, DPM> =
                        Sink::new_with_role(driver, device_policy_manager, data_role);

                    match sink.run().await {
                        Ok(Handover::PowerRoleSwap) => {
                            data_role = sink.data_role();
                            (driver, device_policy_manager) = sink.into_parts();
                        }
                        Err(error) => return Err(Error::Sink(error)),
                    }
                }
                PowerRole::Source => {
                    let mut source: Source<DRIVER, TIMER, DPM> = if after_swap {
                        Source::new_after_power_role_swap(driver, device_policy_manager, data_role)
                    } else {
                        Source::new(driver, device_policy_manager)
                    };

                    match source.run().await {
                        Ok(Handover::PowerRoleSwap) => {
                            data_role = source.data_role();
                            (driver, device_policy_manager) = source.into_parts();
                        }
                        Err(error) => return Err(Error::Source(error)),
                    }
                }
            }

            power_role = power_role.swapped();
            after_swap = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Port};
    use crate::counters::{Counter, CounterType};
    use crate::dummy::{DUMMY_CAPABILITIES, DummyDriver, MAX_DATA_MESSAGE_SIZE, YieldingTimer};
    use crate::protocol_layer::message::Message;
    use crate::protocol_layer::message::header::{ControlMessageType, Header, SpecificationRevision};
    use crate::sink::device_policy_manager::DevicePolicyManager as SinkDevicePolicyManager;
    use crate::source::device_policy_manager::DevicePolicyManager as SourceDevicePolicyManager;
    use crate::source::policy_engine::Error as SourceError;
    use crate::{DataRole, PowerRole};

    /// A dual-role device that accepts power role swaps.
    struct DualRoleDevice {}

    impl SinkDevicePolicyManager for DualRoleDevice {
        async fn accept_power_role_swap(&mut self) -> bool {
            true
        }
    }

    impl SourceDevicePolicyManager for DualRoleDevice {}

    fn source_control_message(control_message_type: ControlMessageType, message_id: u8) -> heapless::Vec<u8, 30> {
        let template = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);

        let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
        let size = Message::new(Header::new_control(
            template,
            Counter::new_from_value(CounterType::MessageId, message_id),
            control_message_type,
        ))
        .to_bytes(&mut buf);

        heapless::Vec::from_slice(&buf[..size]).unwrap()
    }

    #[tokio::test]
    async fn power_role_swap_switches_engines() {
        let mut driver: DummyDriver<MAX_DATA_MESSAGE_SIZE> = DummyDriver::new();

        // Script a full sink negotiation followed by a source-initiated power
        // role swap.
        driver.inject_received_data(&DUMMY_CAPABILITIES);
        driver.inject_received_data(&source_control_message(ControlMessageType::GoodCRC, 0));
        driver.inject_received_data(&source_control_message(ControlMessageType::Accept, 1));
        driver.inject_received_data(&source_control_message(ControlMessageType::PsRdy, 2));
        driver.inject_received_data(&source_control_message(ControlMessageType::PrSwap, 3));
        driver.inject_received_data(&source_control_message(ControlMessageType::GoodCRC, 1));
        driver.inject_received_data(&source_control_message(ControlMessageType::PsRdy, 4));
        driver.inject_received_data(&source_control_message(ControlMessageType::GoodCRC, 0));

        let port: Port<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DualRoleDevice> =
            Port::new_sink(driver, DualRoleDevice {});

        // After the swap, the source engine advertises capabilities that
        // nobody acknowledges, and eventually gives up. The error originating
        // from the source engine proves that the handover took place.
        let result = port.run().await;
        assert!(matches!(
            result,
            Err(Error::Source(SourceError::PortPartnerUnresponsive))
        ));
    }
}
