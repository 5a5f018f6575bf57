//! End-to-end session run against a local store, a scripted model, and a
//! shell-script validator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use polar_tester::client::ModelFuture;
use polar_tester::events::EventType;
use polar_tester::generate::NoopObserver;
use polar_tester::{
    CliValidator, Completion, Error, GenerationRequest, Generator, LocalStore, ModelClient,
    ModelOverrides, SessionManager,
};

/// Fails any policy without an `allow` rule, with a fixed message.
const VALIDATOR_SCRIPT: &str =
    "grep -q 'allow(' \"$0\" || { echo 'error: policy defines no allow rule' >&2; exit 1; }";

struct ScriptedModel {
    replies: Mutex<VecDeque<&'static str>>,
    seen: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedModel {
    fn new(replies: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().copied().collect()),
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl ModelClient for ScriptedModel {
    fn complete<'a>(&'a self, request: &'a GenerationRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(request.clone());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Model("no scripted reply left".into()))?;
            Ok(Completion::text(reply))
        })
    }
}

fn generator(model: Arc<ScriptedModel>, scratch: &std::path::Path) -> Generator {
    let validator = CliValidator::new("sh")
        .with_args(["-c", VALIDATOR_SCRIPT])
        .with_temp_dir(scratch);
    Generator::new(model, Arc::new(validator)).with_observer(NoopObserver)
}

#[tokio::test]
async fn failed_attempt_is_corrected_and_recorded() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(Arc::new(LocalStore::new(root.path())));

    let summary = manager.create_session("Org documents", "").await.unwrap();
    manager
        .set_requirements(&summary.id, "Members can read documents in their organization.")
        .await
        .unwrap();

    let model = ScriptedModel::new(&[
        "```polar\nresource Document { permissions = [\"read\"]; }\n```",
        "resource Document { permissions = [\"read\"]; }\nallow(actor, action, resource) if has_permission(actor, action, resource);",
    ]);
    let result = manager
        .run_generation(
            &summary.id,
            vec!["Polar basics".into()],
            ModelOverrides::default(),
            &generator(model.clone(), scratch.path()),
        )
        .await
        .unwrap();

    assert!(result.passed());
    assert_eq!(result.attempts, 2);

    // The validator's message reaches the correction prompt unchanged.
    let seen = model.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].prior_error(), None);
    assert_eq!(
        seen[1].prior_error(),
        Some("error: policy defines no allow rule")
    );
    assert!(seen[1].user_message().contains("error: policy defines no allow rule"));
    drop(seen);

    // Validator temp files are gone.
    assert!(std::fs::read_dir(scratch.path()).unwrap().next().is_none());

    let session = manager.load(&summary.id).await.unwrap();
    assert_eq!(session.policies.len(), 2);
    let current = session.current_policy().unwrap();
    assert!(current.reworked);
    assert!(current.content.contains("allow("));
    assert_eq!(
        current.prior_error.as_deref(),
        Some("error: policy defines no allow rule")
    );
    assert!(session.validation.as_ref().unwrap().passed);
    assert_eq!(session.test_runs, 1);
    assert_eq!(session.last_test_run.as_ref().unwrap().attempts, 2);

    // Each attempt's candidate was written as an artifact.
    for policy in &session.policies {
        let key = policy.artifact.as_deref().unwrap();
        let stored = std::fs::read_to_string(root.path().join(key)).unwrap();
        assert_eq!(stored, policy.content);
    }

    let types: Vec<EventType> = manager
        .events()
        .read(&summary.id)
        .await
        .unwrap()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::SessionCreated,
            EventType::DocumentCreated,
            EventType::DocumentCreated,
            EventType::ValidationCompleted,
            EventType::DocumentReworked,
            EventType::ValidationCompleted,
            EventType::TestRun,
        ]
    );
}

#[tokio::test]
async fn session_survives_a_new_manager() {
    let root = tempfile::tempdir().unwrap();
    let id = {
        let manager = SessionManager::new(Arc::new(LocalStore::new(root.path())));
        let summary = manager.create_session("Folders", "nested").await.unwrap();
        manager.set_requirements(&summary.id, "v1").await.unwrap();
        manager.set_requirements(&summary.id, "v2").await.unwrap();
        manager.set_notes(&summary.id, "try role inheritance").await.unwrap();
        summary.id
    };

    let manager = SessionManager::new(Arc::new(LocalStore::new(root.path())));
    let session = manager.load(&id).await.unwrap();
    assert_eq!(session.name, "Folders");
    assert_eq!(session.requirements.as_deref(), Some("v2"));
    assert_eq!(session.notes.as_deref(), Some("try role inheritance"));

    let report = manager.events().check_integrity(&id).await.unwrap();
    assert!(report.is_valid, "{:?}", report.issues);
    assert_eq!(report.event_count, 4);

    manager.delete_session(&id).await.unwrap();
    assert!(manager.load(&id).await.unwrap_err().is_not_found());
    assert!(manager.list_sessions().await.unwrap().is_empty());
}
