//! Grounded answering: retrieve, build a prompt, ask the chat model.
//!
//! The model only ever sees chunks returned by a [`Retriever`]. When nothing
//! is retrieved the model is not called at all and the caller gets
//! [`FALLBACK_ANSWER`], so an unscoped or unknown contact can never receive
//! an answer invented from nothing.

use std::sync::Arc;

use anyhow::Result;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::lifecycle::IndexManager;
use crate::llm::{create_chat_model, ChatMessage, ChatModel};
use crate::models::{Answer, ConversationMessage, Direction, RetrievedChunk};
use crate::retrieval::Retriever;
use crate::store::IndexHandle;

pub const FALLBACK_ANSWER: &str = "I couldn't find relevant information for your account.";

const SYSTEM_PROMPT: &str = "You are a CRM sales intelligence assistant. \
The context contains CRM records from HubSpot: Contacts, Companies, Deals, and Owners. \
Treat 'account' as a synonym for Company, 'deal size' as Amount, and 'rep' as Owner. \
Synthesize information across record types to give a complete answer. \
If partial information exists, share what you know and note what is missing. \
Only say you don't know if the context contains no relevant information at all. \
Do not invent data not present in the context.\n\nContext: ";

const CORRECTION_PROMPT: &str = "Fix any typos and rephrase the following CRM question for clarity. \
Return only the corrected question, no explanation:\n\n";

/// One `ask` call: the question plus how to scope and prepare it.
#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub question: String,
    /// Restrict retrieval to this contact's records.
    pub contact_id: Option<String>,
    /// Earlier turns, oldest first, prepended to the question.
    pub history: Vec<ConversationMessage>,
    pub correct_query: bool,
}

pub struct AnswerPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatModel>,
    top_k: usize,
    max_context_chars: usize,
}

impl AnswerPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatModel>,
        settings: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            chat,
            top_k: settings.top_k,
            max_context_chars: settings.max_context_chars,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            create_provider(&config.embedding)?,
            create_chat_model(&config.llm)?,
            &config.retrieval,
        ))
    }

    pub fn retriever(&self, index: &IndexHandle, contact_id: Option<&str>) -> Retriever {
        match contact_id {
            Some(id) => {
                Retriever::scoped_to_contact(index.clone(), self.embedder.clone(), id, self.top_k)
            }
            None => Retriever::new(index.clone(), self.embedder.clone(), self.top_k),
        }
    }

    /// Ask the model to fix typos in `query`. Blank input, or a blank
    /// reply, returns the query unchanged.
    pub async fn correct_query(&self, query: &str) -> Result<String> {
        if query.trim().is_empty() {
            return Ok(query.to_string());
        }
        let reply = self
            .chat
            .complete(&[ChatMessage::user(format!("{}{}", CORRECTION_PROMPT, query))])
            .await?;
        let corrected = reply.trim();
        if corrected.is_empty() {
            Ok(query.to_string())
        } else {
            Ok(corrected.to_string())
        }
    }

    /// Retrieve with `retriever` and answer from the retrieved chunks only.
    pub async fn answer(&self, retriever: &Retriever, question: &str) -> Result<Answer> {
        let hits = retriever.retrieve(question).await?;
        let evidence = bound_context(hits, self.max_context_chars);
        if evidence.iter().all(|c| c.text.trim().is_empty()) {
            tracing::info!("no context retrieved, returning fallback");
            return Ok(Answer {
                text: FALLBACK_ANSWER.to_string(),
                interpreted_as: None,
                evidence: Vec::new(),
            });
        }

        let context = evidence
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages = [
            ChatMessage::system(format!("{}{}", SYSTEM_PROMPT, context)),
            ChatMessage::user(question),
        ];
        let reply = self.chat.complete(&messages).await?;
        let text = match reply.trim() {
            "" => FALLBACK_ANSWER.to_string(),
            t => t.to_string(),
        };

        Ok(Answer {
            text,
            interpreted_as: None,
            evidence,
        })
    }

    /// Full question flow: optional correction, history, optional scope.
    pub async fn ask(&self, index: &IndexHandle, request: &AskRequest) -> Result<Answer> {
        let mut question = request.question.trim().to_string();
        let mut interpreted_as = None;
        if request.correct_query {
            let corrected = self.correct_query(&question).await?;
            if !corrected.eq_ignore_ascii_case(&question) {
                interpreted_as = Some(corrected.clone());
            }
            question = corrected;
        }

        let input = with_conversation(&request.history, &question);
        let retriever = self.retriever(index, request.contact_id.as_deref());
        let mut answer = self.answer(&retriever, &input).await?;
        answer.interpreted_as = interpreted_as;
        Ok(answer)
    }

    /// Contact-scoped answer text for a linked messaging identity.
    pub async fn answer_for_identity(
        &self,
        index: &IndexHandle,
        contact_id: &str,
        question: &str,
    ) -> Result<String> {
        let retriever = self.retriever(index, Some(contact_id));
        Ok(self.answer(&retriever, question).await?.text)
    }
}

/// Keep whole chunks, most relevant first, until `max_chars` is reached.
/// The first chunk is always kept, truncated if it alone is too long.
fn bound_context(hits: Vec<RetrievedChunk>, max_chars: usize) -> Vec<RetrievedChunk> {
    let mut kept = Vec::with_capacity(hits.len());
    let mut used = 0usize;
    for mut hit in hits {
        let len = hit.text.chars().count();
        if kept.is_empty() && len > max_chars {
            hit.text = hit.text.chars().take(max_chars).collect();
            kept.push(hit);
            break;
        }
        if used + len > max_chars {
            break;
        }
        used += len;
        kept.push(hit);
    }
    kept
}

/// Render earlier turns as `[User]: …` / `[Assistant]: …` lines.
pub fn format_conversation(history: &[ConversationMessage]) -> String {
    history
        .iter()
        .map(|m| {
            let role = match m.direction {
                Direction::In => "User",
                Direction::Out => "Assistant",
            };
            format!("[{}]: {}", role, m.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prepend history to the question; the question alone when there is none.
pub fn with_conversation(history: &[ConversationMessage], question: &str) -> String {
    if history.is_empty() {
        return question.to_string();
    }
    format!(
        "Recent conversation with this contact:\n{}\n\nCurrent question: {}",
        format_conversation(history),
        question
    )
}

/// `crag ask`.
pub async fn run_ask(config: &Config, request: &AskRequest, show_sources: bool) -> Result<()> {
    let Some(index) = IndexManager::new(&config.index).load().await else {
        anyhow::bail!(
            "No index for collection '{}'. Run `crag ingest files` or `crag ingest crm` first.",
            config.index.collection
        );
    };
    let pipeline = AnswerPipeline::from_config(config)?;
    let answer = pipeline.ask(&index, request).await?;

    if let Some(corrected) = &answer.interpreted_as {
        println!("Interpreted as: {}\n", corrected);
    }
    println!("{}", answer.text);

    if show_sources && !answer.evidence.is_empty() {
        println!("\nSources:");
        for (i, chunk) in answer.evidence.iter().enumerate() {
            let kind = chunk
                .metadata
                .get(crate::models::keys::OBJECT_TYPE)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "chunk".to_string());
            let first_line = chunk.text.lines().next().unwrap_or_default();
            println!("  {}. [{}] {:.3}  {}", i + 1, kind, chunk.score, first_line);
        }
    }
    Ok(())
}
