//! Outbound delivery of verification and reset codes.
//!
//! Delivery is best effort. Callers log failures and continue; a failed send
//! never fails the flow that issued the code.

pub mod log;
pub mod smtp;

use std::{future::Future, pin::Pin};

pub use self::log::LogNotifier;
pub use self::smtp::{SmtpNotifier, SmtpSettings};

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

pub trait Notifier: Send + Sync {
    fn send_verification_code<'a>(&'a self, email: &'a str, code: &'a str) -> NotifyFuture<'a>;

    fn send_reset_code<'a>(&'a self, email: &'a str, code: &'a str) -> NotifyFuture<'a>;
}
