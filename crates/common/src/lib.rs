// earnings-common: shared types and validators for the earnings-tracker auth service

pub mod types;
pub mod validation;
