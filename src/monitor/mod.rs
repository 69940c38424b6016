//! Monitor - per repository polling and scheduled maintenance
//!
//! A [`Poller`] periodically records the state of one repository. A
//! [`MaintenanceJob`] applies the retention policy on a cron schedule and
//! then triggers an immediate poll through the same poller.

mod maintenance;
mod poller;

pub use maintenance::{removed_per_group, MaintenanceJob};
pub use poller::{initial_delay, Poller, PollerState};
