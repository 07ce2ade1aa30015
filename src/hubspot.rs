//! HubSpot CRM client.
//!
//! Pages through contacts, companies, deals, and owners with the CRM v3
//! REST API and renders each record as a plain-text [`Document`]. Deals are
//! enriched with the name of their first associated company and tagged with
//! their first associated contact, which is what scopes them to that
//! contact at answer time.
//!
//! Tokens issued for the EU data center (`pat-eu1-…`) are sent to
//! `https://api-eu1.hubapi.com` unless `hubspot.base_url` overrides the host.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use serde_json::Value;

use crate::backoff;
use crate::config::{self, HubSpotConfig};
use crate::crm_cache::CrmCache;
use crate::models::{keys, Document, ObjectType};
use crate::progress::{format_number, ProgressSink};

const DEFAULT_BASE_URL: &str = "https://api.hubapi.com";
const EU_BASE_URL: &str = "https://api-eu1.hubapi.com";

const CONTACT_PROPS: &[&str] = &["firstname", "lastname", "email", "phone", "company", "jobtitle"];
const COMPANY_PROPS: &[&str] = &["name", "domain", "industry", "city", "state", "country", "phone"];
const DEAL_PROPS: &[&str] = &["dealname", "dealstage", "amount", "closedate", "pipeline"];

const NA: &str = "N/A";

pub struct HubSpotClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    page_limit: usize,
    max_retries: u32,
}

/// Pick the API host for a token.
pub fn resolve_base_url(configured: Option<&str>, token: &str) -> String {
    match configured {
        Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
        _ if token.trim().to_lowercase().starts_with("pat-eu1") => EU_BASE_URL.to_string(),
        _ => DEFAULT_BASE_URL.to_string(),
    }
}

impl HubSpotClient {
    /// Build a client with the token from `HUBSPOT_ACCESS_TOKEN`.
    pub fn from_config(config: &HubSpotConfig) -> Result<Self> {
        let token = config::env_secret(config::HUBSPOT_ACCESS_TOKEN)?;
        Self::new(config, token)
    }

    pub fn new(config: &HubSpotConfig, token: String) -> Result<Self> {
        Ok(Self {
            client: backoff::client(config.timeout_secs)?,
            base_url: resolve_base_url(config.base_url.as_deref(), &token),
            token,
            page_limit: config.page_limit,
            max_retries: config.max_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Follow `paging.next.after` until exhausted, returning every result.
    async fn fetch_pages(
        &self,
        path: &str,
        query: &[(&str, String)],
        label: &str,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let mut results = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut params: Vec<(&str, String)> = query.to_vec();
            params.push(("limit", self.page_limit.to_string()));
            if let Some(cursor) = &after {
                params.push(("after", cursor.clone()));
            }

            let provider = format!("HubSpot {}", label);
            let page = backoff::send_json(&provider, self.max_retries, || {
                self.client
                    .get(&url)
                    .bearer_auth(&self.token)
                    .query(&params)
            })
            .await?;

            if let Some(items) = page.get("results").and_then(Value::as_array) {
                results.extend(items.iter().cloned());
            }
            progress.fetched(label, results.len());
            tracing::debug!(object = label, fetched = results.len(), "fetched page");

            after = page
                .pointer("/paging/next/after")
                .and_then(value_as_string)
                .filter(|s| !s.is_empty());
            if after.is_none() {
                break;
            }
        }

        Ok(results)
    }

    pub async fn load_contacts(&self, progress: &dyn ProgressSink) -> Result<Vec<Document>> {
        let records = self
            .fetch_pages(
                "/crm/v3/objects/contacts",
                &[("properties", CONTACT_PROPS.join(","))],
                "contacts",
                progress,
            )
            .await?;
        Ok(records.iter().map(contact_document).collect())
    }

    pub async fn load_companies(&self, progress: &dyn ProgressSink) -> Result<Vec<Document>> {
        let records = self
            .fetch_pages(
                "/crm/v3/objects/companies",
                &[("properties", COMPANY_PROPS.join(","))],
                "companies",
                progress,
            )
            .await?;
        Ok(records.iter().map(company_document).collect())
    }

    /// Deals, with company names resolved from `companies`.
    pub async fn load_deals(
        &self,
        progress: &dyn ProgressSink,
        companies: &[Document],
    ) -> Result<Vec<Document>> {
        let company_names = company_name_map(companies);
        let records = self
            .fetch_pages(
                "/crm/v3/objects/deals",
                &[
                    ("properties", DEAL_PROPS.join(",")),
                    ("associations", "companies,contacts".to_string()),
                ],
                "deals",
                progress,
            )
            .await?;
        Ok(records
            .iter()
            .map(|r| deal_document(r, &company_names))
            .collect())
    }

    pub async fn load_owners(&self, progress: &dyn ProgressSink) -> Result<Vec<Document>> {
        let records = self
            .fetch_pages("/crm/v3/owners", &[], "owners", progress)
            .await?;
        Ok(records.iter().map(owner_document).collect())
    }

    /// Every object type, plus a count per type.
    pub async fn load_all(
        &self,
        progress: &dyn ProgressSink,
    ) -> Result<(Vec<Document>, BTreeMap<ObjectType, usize>)> {
        let mut all = Vec::new();
        let mut counts = BTreeMap::new();

        let contacts = self.load_contacts(progress).await?;
        counts.insert(ObjectType::Contact, contacts.len());
        all.extend(contacts);

        let companies = self.load_companies(progress).await?;
        let deals = self.load_deals(progress, &companies).await?;
        counts.insert(ObjectType::Company, companies.len());
        all.extend(companies);
        counts.insert(ObjectType::Deal, deals.len());
        all.extend(deals);

        let owners = self.load_owners(progress).await?;
        counts.insert(ObjectType::Owner, owners.len());
        all.extend(owners);

        Ok((all, counts))
    }
}

/// Fetch everything from HubSpot and upsert it into the local cache.
pub async fn sync_to_cache(
    client: &HubSpotClient,
    cache: &CrmCache,
    progress: &dyn ProgressSink,
) -> Result<BTreeMap<ObjectType, usize>> {
    tracing::info!(base_url = client.base_url(), "syncing CRM records");
    let (docs, counts) = client.load_all(progress).await?;
    cache.save(&docs).await?;
    tracing::info!(records = docs.len(), "CRM cache updated");
    Ok(counts)
}

/// `crag sync crm`.
pub async fn run_sync_crm(config: &config::Config, progress: &dyn ProgressSink) -> Result<()> {
    let client = HubSpotClient::from_config(&config.hubspot)?;
    let cache = CrmCache::open(&config.hubspot.cache_path).await?;
    let counts = sync_to_cache(&client, &cache, progress).await?;

    println!("sync hubspot");
    for (object_type, n) in &counts {
        println!("  {:<10} {}", object_type.as_str(), format_number(*n));
    }
    println!("ok");
    Ok(())
}

// ============ Record rendering ============

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn record_id(record: &Value) -> String {
    record.get("id").and_then(value_as_string).unwrap_or_default()
}

/// Non-empty property value.
fn prop(record: &Value, name: &str) -> Option<String> {
    record
        .get("properties")
        .and_then(|p| p.get(name))
        .and_then(value_as_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn prop_or_na(record: &Value, name: &str) -> String {
    prop(record, name).unwrap_or_else(|| NA.to_string())
}

/// First associated record id of `kind` (e.g. `"contacts"`).
fn first_association(record: &Value, kind: &str) -> Option<String> {
    record
        .get("associations")
        .and_then(|a| a.get(kind))
        .and_then(|a| a.get("results"))
        .and_then(Value::as_array)
        .and_then(|results| results.first())
        .and_then(|first| first.get("id"))
        .and_then(value_as_string)
}

fn crm_document(content: String, object_type: ObjectType, id: String) -> Document {
    Document::new(content)
        .with_meta(keys::SOURCE, "hubspot")
        .with_meta(keys::OBJECT_TYPE, object_type.as_str())
        .with_meta(keys::HS_OBJECT_ID, id)
}

fn full_name(first: Option<String>, last: Option<String>) -> String {
    let name = format!(
        "{} {}",
        first.unwrap_or_default(),
        last.unwrap_or_default()
    );
    let name = name.trim();
    if name.is_empty() {
        "Unknown".to_string()
    } else {
        name.to_string()
    }
}

pub(crate) fn contact_document(record: &Value) -> Document {
    let name = full_name(prop(record, "firstname"), prop(record, "lastname"));
    let lines = [
        format!("Contact: {}", name),
        format!("Email: {}", prop_or_na(record, "email")),
        format!("Phone: {}", prop_or_na(record, "phone")),
        format!("Company: {}", prop_or_na(record, "company")),
        format!("Job Title: {}", prop_or_na(record, "jobtitle")),
    ];
    crm_document(lines.join("\n"), ObjectType::Contact, record_id(record))
}

pub(crate) fn company_document(record: &Value) -> Document {
    let location: Vec<String> = ["city", "state", "country"]
        .iter()
        .filter_map(|p| prop(record, p))
        .collect();
    let lines = [
        format!(
            "Company: {}",
            prop(record, "name").unwrap_or_else(|| "Unknown".to_string())
        ),
        format!("Domain: {}", prop_or_na(record, "domain")),
        format!("Industry: {}", prop_or_na(record, "industry")),
        format!("Location: {}", location.join(", ")),
        format!("Phone: {}", prop_or_na(record, "phone")),
    ];
    crm_document(lines.join("\n"), ObjectType::Company, record_id(record))
}

pub(crate) fn deal_document(record: &Value, company_names: &HashMap<String, String>) -> Document {
    let company_id = first_association(record, "companies");
    let company_name = company_id
        .as_ref()
        .and_then(|id| company_names.get(id))
        .cloned()
        .unwrap_or_else(|| NA.to_string());

    let lines = [
        format!(
            "Deal: {}",
            prop(record, "dealname").unwrap_or_else(|| "Unknown".to_string())
        ),
        format!("Stage: {}", prop_or_na(record, "dealstage")),
        format!("Pipeline: {}", prop_or_na(record, "pipeline")),
        format!("Amount: {}", format_amount(prop(record, "amount").as_deref())),
        format!("Close Date: {}", prop_or_na(record, "closedate")),
        format!("Company: {}", company_name),
    ];

    let mut doc = crm_document(lines.join("\n"), ObjectType::Deal, record_id(record));
    if let Some(contact_id) = first_association(record, "contacts") {
        doc = doc.with_meta(keys::ASSOCIATED_CONTACT_ID, contact_id);
    }
    if let Some(company_id) = company_id {
        doc = doc.with_meta(keys::ASSOCIATED_COMPANY_ID, company_id);
    }
    doc
}

pub(crate) fn owner_document(record: &Value) -> Document {
    let field = |name: &str| {
        record
            .get(name)
            .and_then(value_as_string)
            .filter(|s| !s.trim().is_empty())
    };
    let lines = [
        format!("Owner: {}", full_name(field("firstName"), field("lastName"))),
        format!("Email: {}", field("email").unwrap_or_else(|| NA.to_string())),
    ];
    crm_document(lines.join("\n"), ObjectType::Owner, record_id(record))
}

/// Company id → name, read back from rendered company documents.
fn company_name_map(companies: &[Document]) -> HashMap<String, String> {
    companies
        .iter()
        .filter_map(|doc| {
            let id = doc.hs_object_id()?;
            let first_line = doc.content.lines().next().unwrap_or_default();
            let name = first_line.trim_start_matches("Company: ").trim();
            let name = if name.is_empty() { "Unknown" } else { name };
            Some((id, name.to_string()))
        })
        .collect()
}

/// `"1234.5"` → `"$1,234.50"`. Non-numeric amounts are shown as given.
pub fn format_amount(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return NA.to_string();
    };
    let Ok(value) = raw.trim().parse::<f64>() else {
        return raw.to_string();
    };
    let fixed = format!("{:.2}", value.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let sign = if value < 0.0 { "-" } else { "" };
    format!("${}{}.{}", sign, grouped, frac_part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_base_url() {
        assert_eq!(resolve_base_url(None, "pat-na1-abc"), DEFAULT_BASE_URL);
        assert_eq!(resolve_base_url(None, "PAT-EU1-abc"), EU_BASE_URL);
        assert_eq!(
            resolve_base_url(Some("https://proxy.local/"), "pat-eu1-abc"),
            "https://proxy.local"
        );
    }

    #[test]
    fn test_contact_document() {
        let record = json!({
            "id": "1",
            "properties": {"firstname": "Jane", "lastname": "Doe", "email": "jane@example.com", "phone": ""}
        });
        let doc = contact_document(&record);
        assert_eq!(
            doc.content,
            "Contact: Jane Doe\nEmail: jane@example.com\nPhone: N/A\nCompany: N/A\nJob Title: N/A"
        );
        assert_eq!(doc.hs_object_id().as_deref(), Some("1"));
        assert_eq!(doc.object_type(), Some(ObjectType::Contact));
        assert_eq!(doc.meta(keys::SOURCE).unwrap().to_string(), "hubspot");
    }

    #[test]
    fn test_contact_without_name() {
        let doc = contact_document(&json!({"id": "2", "properties": {}}));
        assert!(doc.content.starts_with("Contact: Unknown\n"));
    }

    #[test]
    fn test_company_document_location() {
        let record = json!({
            "id": "77",
            "properties": {"name": "Acme", "city": "Berlin", "country": "Germany"}
        });
        let doc = company_document(&record);
        assert!(doc.content.contains("Location: Berlin, Germany"));
        assert!(doc.content.contains("Domain: N/A"));
    }

    #[test]
    fn test_deal_document_associations() {
        let companies = vec![company_document(&json!({"id": "77", "properties": {"name": "Acme"}}))];
        let names = company_name_map(&companies);
        let record = json!({
            "id": "500",
            "properties": {"dealname": "Big Deal", "amount": "1234.5", "dealstage": "closedwon"},
            "associations": {
                "companies": {"results": [{"id": "77", "type": "deal_to_company"}]},
                "contacts": {"results": [{"id": "1", "type": "deal_to_contact"}, {"id": "2"}]}
            }
        });
        let doc = deal_document(&record, &names);
        assert!(doc.content.starts_with("Deal: Big Deal\nStage: closedwon\n"));
        assert!(doc.content.contains("Amount: $1,234.50"));
        assert!(doc.content.ends_with("Company: Acme"));
        assert_eq!(
            doc.meta(keys::ASSOCIATED_CONTACT_ID).unwrap().to_string(),
            "1"
        );
    }

    #[test]
    fn test_deal_without_associations() {
        let doc = deal_document(&json!({"id": "9", "properties": {}}), &HashMap::new());
        assert!(doc.content.contains("Amount: N/A"));
        assert!(doc.content.ends_with("Company: N/A"));
        assert!(doc.meta(keys::ASSOCIATED_CONTACT_ID).is_none());
    }

    #[test]
    fn test_owner_document() {
        let doc = owner_document(&json!({"id": 42, "firstName": "Sam", "lastName": "Rep", "email": "sam@co"}));
        assert_eq!(doc.content, "Owner: Sam Rep\nEmail: sam@co");
        assert_eq!(doc.hs_object_id().as_deref(), Some("42"));
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Some("500")), "$500.00");
        assert_eq!(format_amount(Some("1234567.891")), "$1,234,567.89");
        assert_eq!(format_amount(Some("-1500")), "$-1,500.00");
        assert_eq!(format_amount(Some("n/a-ish")), "n/a-ish");
        assert_eq!(format_amount(None), "N/A");
    }
}
