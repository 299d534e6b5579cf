pub mod service;
pub mod supervisor;
pub mod watchdog;

pub use service::ReconciliationLoop;
pub use supervisor::{platform_service_control, ServiceSpec};
pub use watchdog::Watchdog;
