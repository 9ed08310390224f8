pub mod backoff;
pub mod command;
pub mod handler;
pub mod log;
pub mod worker;

#[cfg(test)]
pub(crate) mod fake_device;

use time::OffsetDateTime;

pub fn now_millis() -> i64 {
    docdrop_core::to_millis(OffsetDateTime::now_utc())
}
