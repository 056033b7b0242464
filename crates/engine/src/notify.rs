//! Notification seam.
//!
//! Step handlers send reminders and alerts through
//! [`NotificationSender`]; delivery transport (email, push, ...) lives
//! behind the trait. A send failure is a transient error: the queue
//! retries the whole step per lane policy.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::EngineResult;
use crate::model::{AlertSeverity, Doctor, Patient};

/// Resolved notification recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

impl From<&Patient> for Recipient {
    fn from(patient: &Patient) -> Self {
        Self {
            name: patient.full_name(),
            email: patient.email.clone(),
        }
    }
}

impl From<&Doctor> for Recipient {
    fn from(doctor: &Doctor) -> Self {
        Self {
            name: doctor.full_name(),
            email: doctor.email.clone(),
        }
    }
}

/// Rendered message, transport-agnostic.
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub subject: String,
    pub body: String,
    /// Present for alert notifications.
    pub severity: Option<AlertSeverity>,
}

/// Outbound notification transport.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, recipient: &Recipient, message: &NotificationMessage)
        -> EngineResult<()>;
}

/// Sender that only logs, the default for local runs.
pub struct LogNotifier;

#[async_trait]
impl NotificationSender for LogNotifier {
    async fn send(
        &self,
        recipient: &Recipient,
        message: &NotificationMessage,
    ) -> EngineResult<()> {
        tracing::info!(
            recipient = %recipient.email,
            subject = %message.subject,
            "Notification sent"
        );
        Ok(())
    }
}

/// Sender collecting messages in memory, for tests.
#[derive(Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<(Recipient, NotificationMessage)>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(Recipient, NotificationMessage)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSender for InMemoryNotifier {
    async fn send(
        &self,
        recipient: &Recipient,
        message: &NotificationMessage,
    ) -> EngineResult<()> {
        self.sent
            .lock()
            .await
            .push((recipient.clone(), message.clone()));
        Ok(())
    }
}
