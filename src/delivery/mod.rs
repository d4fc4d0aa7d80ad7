//! Result delivery: a report email with the task's artifacts attached.
//!
//! [`DeliveryPipeline::deliver`] makes exactly one attempt. A failure is
//! logged with the item id and never affects the item's status.

mod archive;
mod mailer;
mod report;

pub use archive::{build_archive, collect_files};
pub use mailer::{MailAttachment, Mailer, OutgoingMail, SmtpMailer, build_message};
pub use report::{Report, escape_html, render};

use std::path::Path;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::types::PendingTask;
use crate::state_machine::ExecutionResult;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("could not build message: {0}")]
    Build(String),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

pub fn archive_name(item_id: i64) -> String {
    format!("task-{item_id}-artifacts.zip")
}

pub struct DeliveryPipeline<M> {
    mailer: M,
}

impl<M: Mailer> DeliveryPipeline<M> {
    pub fn new(mailer: M) -> Self {
        Self { mailer }
    }

    /// Sends the report for `task`. Returns whether the relay accepted it.
    pub async fn deliver(
        &self,
        task: &PendingTask,
        result: &ExecutionResult,
        artifacts_dir: Option<&Path>,
    ) -> bool {
        let attachment = match artifacts_dir {
            Some(dir) => self.package(task.id, dir).await,
            None => None,
        };

        let report = render(task, result, attachment.is_some());
        let mail = OutgoingMail {
            to: task.email.clone(),
            subject: report.subject,
            text: report.text,
            html: report.html,
            attachment,
        };

        match self.mailer.send(mail).await {
            Ok(()) => {
                info!(item_id = task.id, to = %task.email, "result delivered");
                true
            }
            Err(e) => {
                error!(item_id = task.id, error = %e, "result delivery failed");
                false
            }
        }
    }

    async fn package(&self, item_id: i64, dir: &Path) -> Option<MailAttachment> {
        let root = dir.to_path_buf();
        let built = tokio::task::spawn_blocking(move || build_archive(&root)).await;
        match built {
            Ok(Ok(Some(bytes))) => {
                info!(item_id, bytes = bytes.len(), "artifacts archived");
                Some(MailAttachment {
                    filename: archive_name(item_id),
                    bytes,
                })
            }
            Ok(Ok(None)) => {
                info!(item_id, "no artifacts to attach");
                None
            }
            Ok(Err(e)) => {
                warn!(item_id, error = %e, "archiving artifacts failed, sending without attachment");
                None
            }
            Err(e) => {
                warn!(item_id, error = %e, "archive task panicked, sending without attachment");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::types::tests::pending_task;
    use std::sync::Mutex;

    /// Records every mail instead of sending it.
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub sent: Mutex<Vec<OutgoingMail>>,
        pub fail: bool,
    }

    impl Mailer for RecordingMailer {
        async fn send(&self, mail: OutgoingMail) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(mail);
            if self.fail {
                return Err(DeliveryError::Build("relay unreachable".into()));
            }
            Ok(())
        }
    }

    impl<M> DeliveryPipeline<M> {
        pub(crate) fn mailer(&self) -> &M {
            &self.mailer
        }
    }

    fn ok_result() -> ExecutionResult {
        ExecutionResult {
            success: true,
            output: "done".into(),
            error: None,
        }
    }

    #[tokio::test]
    async fn delivers_with_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        let pipeline = DeliveryPipeline::new(RecordingMailer::default());

        assert!(pipeline.deliver(&pending_task(5), &ok_result(), Some(dir.path())).await);

        let sent = pipeline.mailer().sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "dev@example.com");
        assert_eq!(sent[0].subject, "Your AI Task is Complete");
        let attachment = sent[0].attachment.as_ref().unwrap();
        assert_eq!(attachment.filename, "task-5-artifacts.zip");
        assert_eq!(&attachment.bytes[..2], b"PK");
    }

    #[tokio::test]
    async fn archive_failure_drops_only_the_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = DeliveryPipeline::new(RecordingMailer::default());

        let missing = dir.path().join("does-not-exist");
        assert!(pipeline.deliver(&pending_task(6), &ok_result(), Some(&missing)).await);

        let sent = pipeline.mailer().sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].attachment.is_none());
    }

    #[tokio::test]
    async fn relay_failure_is_reported_once() {
        let pipeline = DeliveryPipeline::new(RecordingMailer {
            fail: true,
            ..RecordingMailer::default()
        });

        assert!(!pipeline.deliver(&pending_task(9), &ok_result(), None).await);
        assert_eq!(pipeline.mailer().sent.lock().unwrap().len(), 1);
    }
}
