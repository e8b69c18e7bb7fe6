//! Timers that are used by the protocol layer and policy engines.
//!
//! Every state that waits for a message or a response races its receive
//! future against one of these timers. Restarting a timer means dropping the
//! old future and instantiating a new one, so the most recent duration always
//! wins.
use core::future::Future;

/// The timer trait to implement by the user application.
pub trait Timer {
    /// Expire after the specified number of milliseconds.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()>;
}

/// Types of timers that are used for timeouts.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    CrcReceive,
    DiscoverIdentity,
    HardResetComplete,
    NoResponse,
    PSHardReset,
    PSSourceOff,
    PSSourceOn,
    PSTransition,
    SenderResponse,
    SinkEprEnter,
    SinkEprKeepAlive,
    SinkPpsPeriodic,
    SinkRequest,
    SinkWaitCap,
    SourceCapability,
    SrcRecover,
    SrcTransition,
    SwapSourceStart,
    TypeCSinkWaitCap,
    VconnOn,
    VdmModeEntry,
    VdmModeExit,
    VdmResponse,
}

impl TimerType {
    /// Create a new timer future for a given type.
    ///
    /// Expires after the type's nominal duration. Dropping the future cancels
    /// the timer; creating a new one restarts it.
    pub fn timeout<TIMER: Timer>(self) -> impl Future<Output = ()> {
        TIMER::after_millis(self.duration_millis())
    }

    /// The nominal duration of a timer type in milliseconds.
    pub fn duration_millis(self) -> u64 {
        match self {
            TimerType::CrcReceive => 1,
            TimerType::DiscoverIdentity => 45,
            TimerType::HardResetComplete => 5,
            TimerType::NoResponse => 5000,
            TimerType::PSHardReset => 22,
            TimerType::PSSourceOff => 835,
            TimerType::PSSourceOn => 435,
            TimerType::PSTransition => 500,
            TimerType::SenderResponse => 27,
            TimerType::SinkEprEnter => 500,
            TimerType::SinkEprKeepAlive => 375,
            TimerType::SinkPpsPeriodic => 5000,
            TimerType::SinkRequest => 100,
            TimerType::SinkWaitCap => 2500,
            TimerType::SourceCapability => 150,
            TimerType::SrcRecover => 750,
            TimerType::SrcTransition => 30,
            TimerType::SwapSourceStart => 20,
            TimerType::TypeCSinkWaitCap => 465,
            TimerType::VconnOn => 27,
            TimerType::VdmModeEntry => 45,
            TimerType::VdmModeExit => 45,
            TimerType::VdmResponse => 27,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TimerType;

    #[test]
    fn response_timeouts_are_within_specified_windows() {
        assert!((24..=30).contains(&TimerType::SenderResponse.duration_millis()));
        assert!((24..=30).contains(&TimerType::VdmResponse.duration_millis()));
        assert!((24..=30).contains(&TimerType::VconnOn.duration_millis()));
        assert!((25..=35).contains(&TimerType::SrcTransition.duration_millis()));
        assert!((450..=550).contains(&TimerType::PSTransition.duration_millis()));
        assert!((750..=960).contains(&TimerType::PSSourceOff.duration_millis()));
        assert!((390..=480).contains(&TimerType::PSSourceOn.duration_millis()));
        assert!((310..=620).contains(&TimerType::TypeCSinkWaitCap.duration_millis()));
        assert_eq!(TimerType::PSHardReset.duration_millis(), 22);
        assert_eq!(TimerType::SinkWaitCap.duration_millis(), 2500);
    }
}
