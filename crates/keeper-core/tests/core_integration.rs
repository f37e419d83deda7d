#![allow(clippy::unwrap_used, clippy::expect_used)]

use keeper_core::*;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Secrets never render
// ---------------------------------------------------------------------------

#[test]
fn secret_bytes_debug_is_redacted() {
    let secret = SecretBytes::from("p@ss");
    let rendered = format!("{secret:?}");
    assert!(!rendered.contains("p@ss"));
    assert!(rendered.contains("REDACTED"));
    assert_eq!(secret.expose(), b"p@ss");
    assert_eq!(secret.len(), 4);
}

#[test]
fn credential_errors_carry_identifiers_only() {
    let err = CredentialError::AccessGroupMismatch {
        owner: "repo-1".to_string(),
        presented: Some("g2".to_string()),
    };
    let text = err.to_string();
    assert!(text.contains("repo-1"));
    assert!(!text.contains("p@ss"));
}

// ---------------------------------------------------------------------------
// 2. Request builder and wire form
// ---------------------------------------------------------------------------

#[test]
fn request_builder_defaults_to_current_protocol() {
    let token = Uuid::new_v4();
    let req = ExecutionRequest::new(CallerIdentity::new("app.ui"), "restic")
        .args(["backup", "/tmp/x"])
        .env("RESTIC_CACHE_DIR", "/tmp/cache")
        .token("source", token)
        .credential(CredentialRef::new("repo-1", "RESTIC_PASSWORD").in_group("g1"))
        .timeout(Duration::from_secs(2));

    assert_eq!(req.protocol_version, PROTOCOL_VERSION);
    assert_eq!(req.args, vec!["backup", "/tmp/x"]);
    assert_eq!(req.tokens.get("source"), Some(&token));
    assert_eq!(req.credentials[0].access_group.as_deref(), Some("g1"));
    assert_eq!(req.timeout, Duration::from_secs(2));
}

#[test]
fn request_survives_the_wire() {
    let req = ExecutionRequest::new(CallerIdentity::new("app.ui"), "restic")
        .arg("snapshots")
        .working_dir("/tmp");
    let json = serde_json::to_string(&req).unwrap();
    let back: ExecutionRequest = serde_json::from_str(&json).unwrap();
    assert_eq!(back.request_id, req.request_id);
    assert_eq!(back.caller, req.caller);
    assert_eq!(back.working_dir, req.working_dir);
}

// ---------------------------------------------------------------------------
// 3. Result outcome is exclusive
// ---------------------------------------------------------------------------

#[test]
fn result_outcome_is_exclusive() {
    let id = Uuid::new_v4();
    let ok = ExecutionResult::success(id, Some(0), "snapshot 1a2b saved");
    assert!(ok.is_success());
    assert_eq!(ok.output(), Some("snapshot 1a2b saved"));
    assert!(ok.error().is_none());

    let failed = ExecutionResult::failure(
        id,
        Some(1),
        CommandFailure {
            message: "exit status 1".to_string(),
            stderr: "repository locked".to_string(),
        },
    );
    assert!(!failed.is_success());
    assert!(failed.output().is_none());
    assert_eq!(failed.error().unwrap().stderr, "repository locked");

    let json = serde_json::to_value(&failed).unwrap();
    assert_eq!(json["outcome"]["status"], "failure");
}
