//! The source role implementation.
pub mod device_policy_manager;
pub mod policy_engine;
