//! Account signup workflow.
//!
//! validate -> create_user -> create_organization -> setup_stripe -> send_verification
//!
//! Billing and the verification email are optional: their failures are
//! skipped once retries run out. Step bodies simulate the external systems;
//! a few well-known email addresses trigger failures for manual testing.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use stepline_core::workflow::definition::{Step, Workflow};
use stepline_core::workflow::handler::StepInvocation;
use stepline_types::error::{DefinitionError, StepError};
use stepline_types::workflow::StepResult;

pub const WORKFLOW_NAME: &str = "signup";

const ROLES: [&str; 3] = ["driver", "admin", "owner"];

/// Emails the simulated user directory already knows.
const EXISTING_EMAILS: [&str; 2] = ["existing@example.com", "test@duplicate.com"];

pub fn signup_workflow() -> Result<Workflow, DefinitionError> {
    Workflow::builder(WORKFLOW_NAME)
        .step(
            Step::new("validate", validate)
                .max_retries(3)
                .retry_delay(Duration::from_secs(5))
                .timeout(Duration::from_secs(120)),
        )
        .step(
            Step::new("create_user", create_user)
                .max_retries(3)
                .retry_delay(Duration::from_secs(10))
                .timeout(Duration::from_secs(300)),
        )
        .step(
            Step::new("create_organization", create_organization)
                .max_retries(3)
                .retry_delay(Duration::from_secs(10))
                .timeout(Duration::from_secs(300)),
        )
        .step(
            Step::new("setup_stripe", setup_stripe)
                .optional()
                .max_retries(5)
                .retry_delay(Duration::from_secs(15))
                .queue("external")
                .timeout(Duration::from_secs(600)),
        )
        .step(
            Step::new("send_verification", send_verification)
                .optional()
                .max_retries(3)
                .retry_delay(Duration::from_secs(5))
                .queue("notifications")
                .timeout(Duration::from_secs(120)),
        )
        .flow("validate", "create_user")
        .flow("create_user", "create_organization")
        .flow("create_organization", "setup_stripe")
        .flow("setup_stripe", "send_verification")
        .flow("send_verification", "")
        .validator(validate_input)
        .build()
}

/// Input checks run before a signup is accepted.
pub fn validate_input(input: &Value) -> Result<(), String> {
    let field = |key: &str| input.get(key).and_then(Value::as_str);

    if field("email").is_none_or(str::is_empty) {
        return Err("email is required".to_string());
    }
    if field("password").is_none_or(|p| p.chars().count() < 8) {
        return Err("password must be at least 8 characters".to_string());
    }
    if field("first_name").is_none_or(|n| n.chars().count() < 2) {
        return Err("first_name must be at least 2 characters".to_string());
    }
    if field("last_name").is_none_or(|n| n.chars().count() < 2) {
        return Err("last_name must be at least 2 characters".to_string());
    }
    if field("role").is_none_or(|r| !ROLES.contains(&r)) {
        return Err(format!("role must be one of: {}", ROLES.join(", ")));
    }
    Ok(())
}

fn input_str<'a>(inv: &'a StepInvocation, key: &str) -> &'a str {
    inv.input.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Simulated external id, stable per execution so a replayed step
/// produces the same record.
fn mock_id(prefix: &str, workflow_id: &Uuid) -> String {
    format!("{prefix}_{}", workflow_id.simple())
}

async fn validate(inv: StepInvocation) -> Result<StepResult, StepError> {
    let email = input_str(&inv, "email");
    if EXISTING_EMAILS.contains(&email) {
        return Err(StepError::fatal(format!("email {email} already exists")));
    }

    tracing::info!(workflow_id = %inv.workflow_id, email, "signup validated");
    Ok(StepResult::new()
        .with("validated_email", email)
        .with("validation_completed_at", Utc::now().to_rfc3339()))
}

async fn create_user(inv: StepInvocation) -> Result<StepResult, StepError> {
    let email = input_str(&inv, "email");
    if email == "fail@example.com" {
        return Err(StepError::transient("user directory unavailable"));
    }

    let user_id = mock_id("user", &inv.workflow_id);
    tracing::info!(workflow_id = %inv.workflow_id, user_id = user_id.as_str(), "user created");
    Ok(StepResult::new()
        .with("user_id", user_id)
        .with("user_created_at", Utc::now().to_rfc3339()))
}

async fn create_organization(inv: StepInvocation) -> Result<StepResult, StepError> {
    let Some(user_id) = inv.context.get_str("user_id") else {
        return Err(StepError::fatal("user_id not found in workflow context"));
    };

    let org_id = mock_id("org", &inv.workflow_id);
    tracing::info!(
        workflow_id = %inv.workflow_id,
        user_id,
        organization_id = org_id.as_str(),
        "organization created"
    );
    Ok(StepResult::new()
        .with("organization_id", org_id)
        .with("organization_created_at", Utc::now().to_rfc3339()))
}

async fn setup_stripe(inv: StepInvocation) -> Result<StepResult, StepError> {
    if input_str(&inv, "email") == "stripe_fail@example.com" {
        return Err(StepError::transient("billing provider rejected customer"));
    }

    let customer_id = mock_id("cus", &inv.workflow_id);
    tracing::info!(workflow_id = %inv.workflow_id, customer_id = customer_id.as_str(), "billing customer created");
    Ok(StepResult::new()
        .with("stripe_customer_id", customer_id)
        .with("stripe_setup_at", Utc::now().to_rfc3339()))
}

async fn send_verification(inv: StepInvocation) -> Result<StepResult, StepError> {
    let email = input_str(&inv, "email");
    if email == "email_fail@example.com" {
        return Err(StepError::transient("mail relay refused message"));
    }

    tracing::info!(workflow_id = %inv.workflow_id, email, "verification email sent");
    Ok(StepResult::new()
        .with("verification_email_sent", true)
        .with("verification_sent_at", Utc::now().to_rfc3339()))
}
