use std::time::Duration;

use anyhow::{anyhow, Context};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use super::{Notifier, NotifyFuture};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    code_ttl_minutes: u64,
}

impl SmtpNotifier {
    /// `code_ttl` is only quoted in the email text; the cache enforces it.
    pub fn new(settings: &SmtpSettings, code_ttl: Duration) -> anyhow::Result<Self> {
        let from = settings
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("invalid smtp sender address '{}'", settings.from))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            .with_context(|| format!("failed to create smtp transport for {}", settings.host))?
            .port(settings.port)
            .credentials(Credentials::new(settings.username.clone(), settings.password.clone()))
            .build();

        Ok(Self { transport, from, code_ttl_minutes: (code_ttl.as_secs() / 60).max(1) })
    }

    async fn send(&self, to_email: &str, subject: &str, body: String) -> anyhow::Result<()> {
        let to = to_email
            .parse::<Mailbox>()
            .map_err(|error| anyhow!("invalid recipient address: {error}"))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .context("failed to build email message")?;

        self.transport.send(message).await.context("smtp send failed")?;
        Ok(())
    }
}

fn verification_body(code: &str, minutes: u64) -> String {
    format!(
        "Your verification code is {code}.\n\n\
         It expires in {minutes} minutes. If you did not create an account, \
         you can ignore this email.\n"
    )
}

fn reset_body(code: &str, minutes: u64) -> String {
    format!(
        "Your password reset code is {code}.\n\n\
         It expires in {minutes} minutes. If you did not request a reset, \
         you can ignore this email.\n"
    )
}

impl Notifier for SmtpNotifier {
    fn send_verification_code<'a>(&'a self, email: &'a str, code: &'a str) -> NotifyFuture<'a> {
        let body = verification_body(code, self.code_ttl_minutes);
        Box::pin(self.send(email, "Verify your email", body))
    }

    fn send_reset_code<'a>(&'a self, email: &'a str, code: &'a str) -> NotifyFuture<'a> {
        let body = reset_body(code, self.code_ttl_minutes);
        Box::pin(self.send(email, "Reset your password", body))
    }
}
