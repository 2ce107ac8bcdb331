pub mod poller;

pub use poller::{DuePoller, PollerConfig, ScanReport};
