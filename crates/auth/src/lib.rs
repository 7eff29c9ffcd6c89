// earnings-auth: account signup, login and session lifecycle for the
// earnings-tracker platform.

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod notify;
pub mod session;
pub mod store;
pub mod validation;
