//! Contact-scoped answering over a persisted index.

mod common;

use std::sync::Arc;

use common::{test_config, EchoChat, HashEmbedder};
use crm_rag::answer::{AnswerPipeline, AskRequest, FALLBACK_ANSWER};
use crm_rag::chunk::TextSplitter;
use crm_rag::ingest::IngestPipeline;
use crm_rag::lifecycle::IndexManager;
use crm_rag::models::{keys, Document};
use crm_rag::store::IndexHandle;
use tempfile::TempDir;

fn contact(id: &str, name: &str) -> Document {
    Document::new(format!("Contact: {}\nEmail: {}@x.com", name, id))
        .with_meta(keys::SOURCE, "hubspot")
        .with_meta(keys::OBJECT_TYPE, "contact")
        .with_meta(keys::HS_OBJECT_ID, id)
}

fn deal(id: &str, name: &str, contact_id: &str) -> Document {
    Document::new(format!("Deal: {}\nAmount: $500\nStage: negotiation", name))
        .with_meta(keys::SOURCE, "hubspot")
        .with_meta(keys::OBJECT_TYPE, "deal")
        .with_meta(keys::HS_OBJECT_ID, id)
        .with_meta(keys::ASSOCIATED_CONTACT_ID, contact_id)
}

async fn build(tmp: &TempDir, docs: Vec<Document>) -> IndexHandle {
    let config = test_config(tmp);
    let pipeline = IngestPipeline::new(
        IndexManager::new(&config.index),
        TextSplitter::from_config(&config.chunking).unwrap(),
        Arc::new(HashEmbedder::default()),
        config.ingest.batch_size,
    );
    pipeline
        .ingest_documents_batched(&docs, None, None)
        .await
        .unwrap();
    IndexManager::new(&config.index)
        .load()
        .await
        .expect("index loads after ingest")
}

fn answers(tmp: &TempDir, chat: Arc<EchoChat>) -> AnswerPipeline {
    AnswerPipeline::new(
        Arc::new(HashEmbedder::default()),
        chat,
        &test_config(tmp).retrieval,
    )
}

#[tokio::test]
async fn linked_contact_sees_own_deal() {
    let tmp = TempDir::new().unwrap();
    let index = build(
        &tmp,
        vec![
            Document::new("Contact: Jane Doe\nEmail: jane@x.com")
                .with_meta(keys::OBJECT_TYPE, "contact")
                .with_meta(keys::HS_OBJECT_ID, "1"),
            Document::new("Deal: Big Deal\nAmount:$500")
                .with_meta(keys::OBJECT_TYPE, "deal")
                .with_meta(keys::HS_OBJECT_ID, "2")
                .with_meta(keys::ASSOCIATED_CONTACT_ID, "1"),
        ],
    )
    .await;
    let chat = Arc::new(EchoChat::default());
    let pipeline = answers(&tmp, chat.clone());

    let text = pipeline
        .answer_for_identity(&index, "1", "what deals does this contact have?")
        .await
        .unwrap();
    assert!(text.contains("Big Deal"));

    let text = pipeline
        .answer_for_identity(&index, "99", "what deals does this contact have?")
        .await
        .unwrap();
    assert_eq!(text, FALLBACK_ANSWER);
    assert_eq!(chat.calls(), 1);
}

#[tokio::test]
async fn scoped_answers_never_leak_other_contacts() {
    let tmp = TempDir::new().unwrap();
    let index = build(
        &tmp,
        vec![
            contact("10", "Alice Able"),
            deal("100", "Alpha Expansion", "10"),
            deal("101", "Alpha Renewal", "10"),
            contact("20", "Bob Baker"),
            deal("200", "Bravo Pilot", "20"),
        ],
    )
    .await;
    let pipeline = answers(&tmp, Arc::new(EchoChat::default()));

    for question in [
        "what deals are open?",
        "tell me about Bravo Pilot",
        "Bob Baker email",
        "negotiation stage amount",
    ] {
        let a = pipeline
            .answer_for_identity(&index, "10", question)
            .await
            .unwrap();
        assert!(!a.contains("Bravo"), "leaked into {:?}: {}", question, a);
        assert!(!a.contains("Bob Baker"), "leaked into {:?}: {}", question, a);

        let b = pipeline
            .answer_for_identity(&index, "20", question)
            .await
            .unwrap();
        assert!(!b.contains("Alpha"), "leaked into {:?}: {}", question, b);
        assert!(!b.contains("Alice"), "leaked into {:?}: {}", question, b);
    }
}

#[tokio::test]
async fn top_k_is_drawn_from_the_permitted_subset() {
    let tmp = TempDir::new().unwrap();
    let mut docs = vec![contact("1", "Jane Doe"), deal("2", "Small Deal", "1")];
    // Many near-identical records of another contact that would crowd out
    // Jane's records in an unfiltered top-K.
    for i in 0..30 {
        docs.push(deal(&format!("9{}", i), &format!("Deal number {}", i), "9"));
    }
    let index = build(&tmp, docs).await;
    let pipeline = answers(&tmp, Arc::new(EchoChat::default()));

    let unscoped = pipeline
        .retriever(&index, None)
        .retrieve("deal amount negotiation")
        .await
        .unwrap();
    assert_eq!(unscoped.len(), 5);

    let scoped = pipeline
        .retriever(&index, Some("1"))
        .retrieve("deal amount negotiation")
        .await
        .unwrap();
    assert_eq!(scoped.len(), 2);
    for hit in &scoped {
        let owner = hit
            .metadata
            .get(keys::HS_OBJECT_ID)
            .and_then(|v| v.key_text())
            .unwrap();
        let assoc = hit
            .metadata
            .get(keys::ASSOCIATED_CONTACT_ID)
            .and_then(|v| v.key_text());
        assert!(owner == "1" || assoc.as_deref() == Some("1"));
    }
}

#[tokio::test]
async fn ask_reports_evidence_and_skips_correction_when_disabled() {
    let tmp = TempDir::new().unwrap();
    let index = build(&tmp, vec![contact("1", "Jane Doe"), deal("2", "Big Deal", "1")]).await;
    let chat = Arc::new(EchoChat::default());
    let pipeline = answers(&tmp, chat.clone());

    let answer = pipeline
        .ask(
            &index,
            &AskRequest {
                question: "  which deals?  ".to_string(),
                contact_id: Some("1".to_string()),
                history: Vec::new(),
                correct_query: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(answer.interpreted_as, None);
    assert_eq!(answer.evidence.len(), 2);
    assert_eq!(chat.calls(), 1);
    let prompts = chat.prompts.lock().unwrap();
    assert_eq!(prompts[0][1].content, "which deals?");
}
