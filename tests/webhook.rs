//! Messenger webhook driven through the axum router.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use common::{test_config, EchoChat, HashEmbedder};
use crm_rag::answer::AnswerPipeline;
use crm_rag::cache::IndexCache;
use crm_rag::chunk::TextSplitter;
use crm_rag::identity::{IdentityStore, SqliteIdentityStore};
use crm_rag::ingest::IngestPipeline;
use crm_rag::db;
use crm_rag::lifecycle::{IndexManager, IndexStatus};
use crm_rag::messenger::{sign, Messenger};
use crm_rag::models::{keys, Direction, Document};
use crm_rag::webhook::{router, WebhookState, ERROR_REPLY, NOT_READY_REPLY, UNLINKED_REPLY};
use tempfile::TempDir;

const SECRET: &str = "app-secret";

#[derive(Default)]
struct RecordingMessenger {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMessenger {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until `n` replies have gone out.
    async fn wait_for(&self, n: usize) -> Vec<(String, String)> {
        for _ in 0..200 {
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("expected {} replies, got {:?}", n, self.sent());
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, identity: &str, text: &str) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((identity.to_string(), text.to_string()));
        true
    }
}

struct Harness {
    _tmp: TempDir,
    app: Router,
    messenger: Arc<RecordingMessenger>,
    identities: Arc<SqliteIdentityStore>,
    chat: Arc<EchoChat>,
    manager: IndexManager,
}

async fn harness(app_secret: Option<&str>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let manager = IndexManager::new(&config.index);
    let messenger = Arc::new(RecordingMessenger::default());
    let identities = Arc::new(SqliteIdentityStore::open(&config.identity.path).await.unwrap());
    let chat = Arc::new(EchoChat::default());

    let state = WebhookState {
        cache: Arc::new(IndexCache::new(Arc::new(manager.clone()))),
        answers: Arc::new(AnswerPipeline::new(
            Arc::new(HashEmbedder::default()),
            chat.clone(),
            &config.retrieval,
        )),
        identities: identities.clone(),
        messenger: messenger.clone(),
        verify_token: Some("verify-me".to_string()),
        app_secret: app_secret.map(str::to_string),
        history_limit: 10,
    };

    Harness {
        app: router(state),
        _tmp: tmp,
        messenger,
        identities,
        chat,
        manager,
    }
}

async fn ingest_crm(h: &Harness) {
    let docs = vec![
        Document::new("Contact: Jane Doe\nEmail: jane@x.com")
            .with_meta(keys::OBJECT_TYPE, "contact")
            .with_meta(keys::HS_OBJECT_ID, "1"),
        Document::new("Deal: Big Deal\nAmount: $500")
            .with_meta(keys::OBJECT_TYPE, "deal")
            .with_meta(keys::HS_OBJECT_ID, "2")
            .with_meta(keys::ASSOCIATED_CONTACT_ID, "1"),
        Document::new("Deal: Someone Else's Deal\nAmount: $9,000")
            .with_meta(keys::OBJECT_TYPE, "deal")
            .with_meta(keys::HS_OBJECT_ID, "3")
            .with_meta(keys::ASSOCIATED_CONTACT_ID, "7"),
    ];
    IngestPipeline::new(
        h.manager.clone(),
        TextSplitter::new(500, 50).unwrap(),
        Arc::new(HashEmbedder::default()),
        10,
    )
    .ingest_documents_batched(&docs, None, None)
    .await
    .unwrap();
}

fn message_body(psid: &str, text: &str) -> String {
    serde_json::json!({
        "object": "page",
        "entry": [{
            "id": "page-1",
            "messaging": [{
                "sender": { "id": psid },
                "recipient": { "id": "page-1" },
                "message": { "mid": "m-1", "text": text }
            }]
        }]
    })
    .to_string()
}

fn post(body: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        builder = builder.header("X-Hub-Signature-256", sig);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn signed(body: &str) -> Request<Body> {
    post(body, sign(body.as_bytes(), SECRET))
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn verification_handshake() {
    let h = harness(None).await;

    let (status, body) = call(
        &h.app,
        get("/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "12345");

    let (status, body) = call(
        &h.app,
        get("/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Forbidden");

    let (status, _) = call(&h.app, get("/webhook?hub.verify_token=verify-me")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn signature_is_enforced_when_secret_is_set() {
    let h = harness(Some(SECRET)).await;
    let body = message_body("psid-1", "hello");

    let (status, text) = call(&h.app, post(&body, Some("sha256=deadbeef".into()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(text, "Invalid signature");

    let (status, _) = call(&h.app, post(&body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, text) = call(&h.app, signed(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "OK");
}

#[tokio::test]
async fn malformed_and_foreign_payloads() {
    let h = harness(Some(SECRET)).await;

    let (status, text) = call(&h.app, signed("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text, "Bad request");

    let (status, text) = call(&h.app, signed(r#"{"object":"instagram","entry":[]}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "OK");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.messenger.sent().is_empty());
}

#[tokio::test]
async fn unlinked_sender_gets_onboarding_reply() {
    let h = harness(None).await;
    let (status, _) = call(&h.app, post(&message_body("psid-9", "hi there"), None)).await;
    assert_eq!(status, StatusCode::OK);

    let sent = h.messenger.wait_for(1).await;
    assert_eq!(sent[0], ("psid-9".to_string(), UNLINKED_REPLY.to_string()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = h.identities.recent_messages("psid-9", 10).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].direction, Direction::Out);
    assert_eq!(stored[1].text, "hi there");
    assert_eq!(h.chat.calls(), 0);
}

#[tokio::test]
async fn linked_sender_without_index_is_told_to_wait() {
    let h = harness(None).await;
    h.identities.link("psid-1", "1", Some("Jane Doe")).await.unwrap();

    call(&h.app, post(&message_body("psid-1", "my deals?"), None)).await;
    let sent = h.messenger.wait_for(1).await;
    assert_eq!(sent[0].1, NOT_READY_REPLY);
}

#[tokio::test]
async fn linked_sender_gets_scoped_answer_with_history() {
    let h = harness(None).await;
    ingest_crm(&h).await;
    h.identities.link("psid-1", "1", Some("Jane Doe")).await.unwrap();

    call(&h.app, post(&message_body("psid-1", "what deals do I have?"), None)).await;
    let sent = h.messenger.wait_for(1).await;
    assert!(sent[0].1.contains("Big Deal"));
    assert!(!sent[0].1.contains("Someone Else"));

    // Give the task time to store its reply before the follow-up arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    call(&h.app, post(&message_body("psid-1", "and the amount?"), None)).await;
    h.messenger.wait_for(2).await;

    let prompts = h.chat.prompts.lock().unwrap();
    let question = &prompts[1][1].content;
    assert!(question.starts_with(
        "Recent conversation with this contact:\n[User]: what deals do I have?\n[Assistant]: "
    ));
    assert!(question.ends_with("\n\nCurrent question: and the amount?"));
}

#[tokio::test]
async fn corrupt_index_is_dropped_from_cache_and_discarded() {
    let h = harness(None).await;
    ingest_crm(&h).await;
    h.identities.link("psid-1", "1", Some("Jane Doe")).await.unwrap();

    call(&h.app, post(&message_body("psid-1", "what deals do I have?"), None)).await;
    let sent = h.messenger.wait_for(1).await;
    assert!(sent[0].1.contains("Big Deal"));

    // The loaded index stays cached; damage it underneath.
    let pool = db::connect(h.manager.db_file()).await.unwrap();
    sqlx::query("UPDATE vectors SET embedding = X'0000'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    call(&h.app, post(&message_body("psid-1", "and the amount?"), None)).await;
    let sent = h.messenger.wait_for(2).await;
    assert_eq!(sent[1].1, ERROR_REPLY);

    // The failed search invalidated the cache, so this reload probes the
    // index, finds the damage, and discards the collection.
    call(&h.app, post(&message_body("psid-1", "hello?"), None)).await;
    let sent = h.messenger.wait_for(3).await;
    assert_eq!(sent[2].1, NOT_READY_REPLY);
    assert_eq!(h.manager.status().await, IndexStatus::Absent);
}

#[tokio::test]
async fn echoes_and_empty_messages_are_ignored() {
    let h = harness(None).await;
    let body = serde_json::json!({
        "object": "page",
        "entry": [{
            "messaging": [
                { "sender": { "id": "page-1" }, "message": { "text": "sent by page", "is_echo": true } },
                { "sender": { "id": "psid-2" }, "message": { "text": "   " } },
                { "sender": { "id": "psid-2" }, "delivery": { "watermark": 1 } }
            ]
        }]
    })
    .to_string();

    let (status, _) = call(&h.app, post(&body, None)).await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.messenger.sent().is_empty());
    assert!(h.identities.recent_messages("psid-2", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn health_reports_version() {
    let h = harness(None).await;
    let (status, body) = call(&h.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}
