//! Background task abstraction

pub mod worker;

pub use worker::{BackgroundTask, Schedule, TaskControl, WakeSignal, Waker};
