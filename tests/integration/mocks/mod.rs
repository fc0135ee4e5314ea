#![allow(dead_code)]

pub mod driver_mock;
pub mod webhook_mock;

pub use driver_mock::{MockConnection, MockStats, PREPARE_MS};
pub use webhook_mock::setup_webhook_mock;
