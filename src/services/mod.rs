pub mod audit_service;
pub mod broadcast;
pub mod checkpoint_service;
pub mod transfer_service;
