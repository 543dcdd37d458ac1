//! VelBackuper - host side backup engine for S3 compatible object
//! stores.
//!
//! The library crate wires the collectors and engines from
//! [vbk_client] and the data layout from [vbk_datastore] into complete
//! job runs: configuration, locking, notification, scheduling and the
//! systemd integration live here.

pub mod config;
pub mod doctor;
pub mod lock;
pub mod notify;
pub mod run;
pub mod systemd;

pub use config::Config;
pub use run::{JobSelection, RunContext};

/// Hostname as recorded in archive keys and notifications.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
