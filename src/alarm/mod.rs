//! Alert outputs for the monitor: a local buzzer and a push notification to
//! the guardian's phone.

pub mod buzzer;
pub mod push;
