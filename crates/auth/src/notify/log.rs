use super::{Notifier, NotifyFuture};

/// Used when no SMTP relay is configured. Records that a code went out; the
/// code itself is never written to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_verification_code<'a>(&'a self, email: &'a str, _code: &'a str) -> NotifyFuture<'a> {
        Box::pin(async move {
            tracing::info!(email = %email, kind = "verification", "code issued; smtp disabled");
            Ok(())
        })
    }

    fn send_reset_code<'a>(&'a self, email: &'a str, _code: &'a str) -> NotifyFuture<'a> {
        Box::pin(async move {
            tracing::info!(email = %email, kind = "password_reset", "code issued; smtp disabled");
            Ok(())
        })
    }
}
