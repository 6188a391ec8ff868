use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::config::SmtpConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::model::Channel;
use crate::queue::Job;
use crate::resolver::Recipient;
use crate::template::RenderedContent;

use super::ChannelAdapter;

/// SMTP delivery via lettre.
pub struct SmtpAdapter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpAdapter {
    pub fn new(config: &SmtpConfig) -> DispatchResult<Self> {
        let transport = Self::build_transport(config)?;
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse()
            .map_err(|e| DispatchError::internal(format!("invalid SMTP from address: {}", e)))?;
        Ok(Self { transport, from })
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> DispatchResult<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| DispatchError::internal(format!("SMTP relay setup: {}", e)))?
        } else {
            // Plaintext transport for local dev relays (Mailpit and friends).
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        }
        .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }

    fn build_message(
        &self,
        to: &str,
        content: &RenderedContent,
    ) -> DispatchResult<Message> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| DispatchError::AdapterPermanent(format!("invalid address {}: {}", to, e)))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(content.title.clone());

        // Rendered HTML is preferred as the body when the template carries it.
        let message = match &content.html_content {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(content.message.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            ),
            None => builder.singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(content.message.clone()),
            ),
        }
        .map_err(|e| DispatchError::internal(format!("message build: {}", e)))?;

        Ok(message)
    }
}

#[async_trait]
impl ChannelAdapter for SmtpAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn deliver(
        &self,
        job: &Job,
        recipient: &Recipient,
        content: &RenderedContent,
    ) -> DispatchResult<()> {
        let address = match recipient {
            Recipient::Email(addr) => addr,
            _ => {
                return Err(DispatchError::internal(
                    "email adapter invoked with non-email recipient",
                ))
            }
        };

        debug!(
            notification_id = %job.notification_id,
            to = %address,
            subject = %content.title,
            "sending email"
        );

        let message = self.build_message(address, content)?;

        self.transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                DispatchError::AdapterPermanent(format!("SMTP rejected: {}", e))
            } else {
                DispatchError::AdapterTransient(format!("SMTP send failed: {}", e))
            }
        })?;

        info!(
            notification_id = %job.notification_id,
            to = %address,
            "email sent"
        );
        Ok(())
    }
}
