//! Communication with services

pub mod service;

pub use crate::kif::service::ServiceCmd;
pub use service::{
    label_service, QueuedMsg, SendQueue, Service, ServiceId, ServiceList, ServiceRef,
    SRV_QUEUE_CAPACITY,
};
