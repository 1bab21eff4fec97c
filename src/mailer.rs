// src/mailer.rs
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

/// Outbound notification hook. Strictly fire-and-forget: a delivery failure
/// is logged and must never roll back or block the core path that fired it.
#[derive(Clone)]
pub struct Mailer {
    user: String,
    pass: String,
    relay: String,
    enabled: bool,
}

impl Mailer {
    pub fn from_env() -> Self {
        let user = std::env::var("MAIL_USER").unwrap_or_default();
        let pass = std::env::var("MAIL_PASS").unwrap_or_default();
        let relay = std::env::var("MAIL_RELAY").unwrap_or_else(|_| "smtp.gmail.com".to_string());
        let enabled = !user.is_empty() && !pass.is_empty();
        if !enabled {
            log::info!("MAIL_USER/MAIL_PASS not set, mail notifications disabled");
        }
        Mailer { user, pass, relay, enabled }
    }

    pub fn disabled() -> Self {
        Mailer {
            user: String::new(),
            pass: String::new(),
            relay: String::new(),
            enabled: false,
        }
    }

    /// Send on a blocking worker thread; callers only fire after their own
    /// transaction has committed.
    pub fn notify(&self, to: String, subject: String, body: String) {
        if !self.enabled {
            return;
        }
        let mailer = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = mailer.send_blocking(&to, &subject, &body) {
                log::error!("mail notification to {} failed: {}", to, e);
            }
        });
    }

    fn send_blocking(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(self.user.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        let transport = SmtpTransport::relay(&self.relay)?
            .credentials(Credentials::new(self.user.clone(), self.pass.clone()))
            .build();

        transport.send(&email)?;
        Ok(())
    }
}
