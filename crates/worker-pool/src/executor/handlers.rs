//! The five action handlers, dispatched by step type.
//!
//! Each handler performs the step's side effect and returns the result
//! payload persisted on the step document. Failures against external
//! dependencies surface as transient errors so the lane's retry policy
//! applies.

use chrono::Utc;
use serde_json::{json, Value};

use carepath_engine::engine::parse_duration_token;
use carepath_engine::error::{EngineError, EngineResult};
use carepath_engine::model::{
    ActionSpec, AlertSeverity, Doctor, NotifyTarget, Patient, WorkflowStep,
};
use carepath_engine::notify::{NotificationMessage, NotificationSender, Recipient};

/// Run the handler matching the step's action.
pub async fn run(
    step: &WorkflowStep,
    patient: &Patient,
    doctor: &Doctor,
    notifier: &dyn NotificationSender,
) -> EngineResult<Value> {
    match &step.action {
        ActionSpec::Reminder { message, target } => {
            reminder(step, patient, doctor, notifier, message, *target).await
        }
        ActionSpec::Task {
            description,
            payload,
        } => task(description, payload.as_ref()),
        ActionSpec::Alert { message, severity } => {
            alert(step, patient, doctor, notifier, message, *severity).await
        }
        ActionSpec::Appointment { reason, lead_time } => {
            appointment(step, patient, notifier, reason, lead_time.as_deref()).await
        }
        ActionSpec::AnalysisTest {
            test_name,
            required_fields,
        } => analysis_test(step, test_name, required_fields),
    }
}

async fn reminder(
    step: &WorkflowStep,
    patient: &Patient,
    doctor: &Doctor,
    notifier: &dyn NotificationSender,
    message: &str,
    target: NotifyTarget,
) -> EngineResult<Value> {
    let notification = NotificationMessage {
        subject: format!("Follow-up reminder: {}", step.name),
        body: message.to_string(),
        severity: None,
    };
    let mut notified = Vec::new();
    if matches!(target, NotifyTarget::Patient | NotifyTarget::Both) {
        notifier
            .send(&Recipient::from(patient), &notification)
            .await?;
        notified.push("patient");
    }
    if matches!(target, NotifyTarget::Doctor | NotifyTarget::Both) {
        notifier
            .send(&Recipient::from(doctor), &notification)
            .await?;
        notified.push("doctor");
    }
    Ok(json!({
        "message": message,
        "notified": notified,
        "sent_at": Utc::now(),
    }))
}

/// Task outcome values land on the step result so parameter-based
/// branch conditions can read them.
fn task(description: &str, payload: Option<&Value>) -> EngineResult<Value> {
    let mut result = serde_json::Map::new();
    result.insert("description".to_string(), json!(description));
    result.insert("performed_at".to_string(), json!(Utc::now()));
    match payload {
        Some(Value::Object(fields)) => {
            for (key, value) in fields {
                result.insert(key.clone(), value.clone());
            }
        }
        Some(other) => {
            result.insert("payload".to_string(), other.clone());
        }
        None => {}
    }
    Ok(Value::Object(result))
}

async fn alert(
    step: &WorkflowStep,
    patient: &Patient,
    doctor: &Doctor,
    notifier: &dyn NotificationSender,
    message: &str,
    severity: AlertSeverity,
) -> EngineResult<Value> {
    let notification = NotificationMessage {
        subject: format!("Clinical alert for {}: {}", patient.full_name(), step.name),
        body: message.to_string(),
        severity: Some(severity),
    };
    notifier
        .send(&Recipient::from(doctor), &notification)
        .await?;
    Ok(json!({
        "message": message,
        "severity": severity,
        "patient_id": patient.id,
        "raised_at": Utc::now(),
    }))
}

async fn appointment(
    step: &WorkflowStep,
    patient: &Patient,
    notifier: &dyn NotificationSender,
    reason: &str,
    lead_time: Option<&str>,
) -> EngineResult<Value> {
    let lead = lead_time
        .and_then(|token| {
            let parsed = parse_duration_token(token);
            if parsed.is_none() {
                tracing::warn!(step_id = %step.id, token, "Malformed appointment lead time");
            }
            parsed
        })
        .unwrap_or_default();
    let requested_at =
        Utc::now() + chrono::Duration::from_std(lead).unwrap_or_else(|_| chrono::Duration::zero());

    notifier
        .send(
            &Recipient::from(patient),
            &NotificationMessage {
                subject: "Appointment request".to_string(),
                body: format!("An appointment has been requested: {reason}"),
                severity: None,
            },
        )
        .await?;
    Ok(json!({
        "reason": reason,
        "requested_at": requested_at,
    }))
}

/// Validate submitted test values already present on the step result.
/// Missing values are transient: the patient has not submitted yet.
fn analysis_test(
    step: &WorkflowStep,
    test_name: &str,
    required_fields: &[String],
) -> EngineResult<Value> {
    let submitted = step
        .result
        .as_ref()
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let missing: Vec<&String> = required_fields
        .iter()
        .filter(|field| !submitted.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::Transient(format!(
            "test {test_name} is missing values for {missing:?}"
        )));
    }

    Ok(json!({
        "test_name": test_name,
        "values": submitted,
        "recorded_at": Utc::now(),
    }))
}
