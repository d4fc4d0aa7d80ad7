use std::future::Future;

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::DeliveryError;
use crate::config::MailConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct MailAttachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub attachment: Option<MailAttachment>,
}

pub trait Mailer: Send + Sync {
    fn send(&self, mail: OutgoingMail) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Sends through an SMTP relay with STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self, DeliveryError> {
        let from = Mailbox::new(
            Some(config.from_name.clone()).filter(|n| !n.is_empty()),
            config.from_address.parse()?,
        );
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port);
        if !config.smtp_pass.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.login().to_string(),
                config.smtp_pass.clone(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

pub fn build_message(from: &Mailbox, mail: OutgoingMail) -> Result<Message, DeliveryError> {
    let builder = Message::builder()
        .from(from.clone())
        .to(mail.to.parse()?)
        .subject(mail.subject);
    let body = MultiPart::alternative_plain_html(mail.text, mail.html);

    let message = match mail.attachment {
        Some(attachment) => {
            let zip = ContentType::parse("application/zip")
                .map_err(|e| DeliveryError::Build(e.to_string()))?;
            builder.multipart(
                MultiPart::mixed()
                    .multipart(body)
                    .singlepart(Attachment::new(attachment.filename).body(attachment.bytes, zip)),
            )
        }
        None => builder.multipart(body),
    };
    message.map_err(|e| DeliveryError::Build(e.to_string()))
}

impl Mailer for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), DeliveryError> {
        let message = build_message(&self.from, mail)?;
        self.transport.send(message).await?;
        Ok(())
    }
}
