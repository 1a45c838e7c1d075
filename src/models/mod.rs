pub mod answer;
pub mod attempt;
pub mod audit_log;
pub mod transfer;
