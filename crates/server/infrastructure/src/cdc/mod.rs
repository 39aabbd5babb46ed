//! Change data capture: graph sync consumers, their manager and the bus
//! bridge

mod base;
pub mod employee_consumer;
pub mod manager;
pub mod organization_consumer;
pub mod sync_service;

pub use employee_consumer::EmployeeGraphConsumer;
pub use manager::{CdcConsumerManager, ManagerHealth};
pub use organization_consumer::OrganizationGraphConsumer;
pub use sync_service::{CdcSyncService, ReplayReport, SyncStatistics};
