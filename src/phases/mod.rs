use std::time::Duration;

use crate::config::Config;
use crate::driver::DriverOptions;

pub mod assemble;
pub mod download;
pub mod elements;
pub mod shots;
pub mod upload;

pub fn driver_options(config: &Config, force: bool) -> DriverOptions {
    DriverOptions {
        poll_interval: Duration::from_secs(config.polling.interval_seconds),
        max_wait: Duration::from_secs(config.polling.max_wait_seconds),
        concurrency: config.polling.concurrency,
        force,
    }
}
