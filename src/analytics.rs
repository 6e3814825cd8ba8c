//! Analytics sink clients and the fixed read queries
//!
//! The gateway never exposes a query language: the analytics surface is a
//! closed set of aggregates listed in [`AnalyticsQuery`]. With an external
//! sink configured the gateway forwards reads to it; without one, events are
//! held in memory and aggregated in process, which keeps a single-node
//! deployment fully functional.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::events::{EventSink, EventStatus, EventType, NormalizedEvent, StoredEvent};
use crate::semantic_cache::CacheDecision;

/// The fixed set of read queries on the analytics surface.
#[derive(Clone, Debug)]
pub enum AnalyticsQuery {
    Stats { date_from: Option<DateTime<Utc>>, date_to: Option<DateTime<Utc>> },
    Logs { limit: usize },
    Timeseries { date_from: Option<DateTime<Utc>>, date_to: Option<DateTime<Utc>> },
    Agents,
    AgentDetail { name: String },
    AgentTimeseries { name: String },
    RoiReport,
    Streaming,
}

/// Tag prefix carrying the agent name on `agent_step` events.
pub const AGENT_TAG_PREFIX: &str = "agent:";

fn agent_name(event: &NormalizedEvent) -> Option<&str> {
    event
        .tags
        .iter()
        .find_map(|tag| tag.strip_prefix(AGENT_TAG_PREFIX))
}

fn in_range(
    event: &NormalizedEvent,
    from: &Option<DateTime<Utc>>,
    to: &Option<DateTime<Utc>>,
) -> bool {
    if let Some(from) = from {
        if event.timestamp < *from {
            return false;
        }
    }
    if let Some(to) = to {
        if event.timestamp > *to {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Event store used when no external sink is configured. Also the test
/// double for the pipeline suites.
#[derive(Default)]
pub struct MemoryEventSink {
    events: RwLock<Vec<StoredEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn all(&self) -> Vec<StoredEvent> {
        self.events.read().await.clone()
    }

    async fn stats(
        &self,
        project_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> serde_json::Value {
        let events = self.events.read().await;
        let selected: Vec<&StoredEvent> = events
            .iter()
            .filter(|s| s.event.project_id == project_id && in_range(&s.event, &from, &to))
            .collect();

        let total = selected.len() as u64;
        let mut cost = 0.0;
        let mut potential = 0.0;
        let mut hits = 0u64;
        let mut errors = 0u64;
        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;
        for s in &selected {
            cost += s.event.cost_usd;
            potential += s.event.potential_cost_usd;
            tokens_in += s.event.tokens_in as u64;
            tokens_out += s.event.tokens_out as u64;
            if s.event.cache_decision != CacheDecision::Miss {
                hits += 1;
            }
            if s.event.status != EventStatus::Success {
                errors += 1;
            }
        }

        serde_json::json!({
            "total_events": total,
            "total_cost_usd": cost,
            "potential_cost_usd": potential,
            "saved_usd": potential - cost,
            "cache_hits": hits,
            "cache_hit_rate": if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            "errors": errors,
            "tokens_in": tokens_in,
            "tokens_out": tokens_out,
        })
    }

    async fn timeseries(
        &self,
        project_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> serde_json::Value {
        let events = self.events.read().await;
        let mut days: HashMap<String, (u64, f64)> = HashMap::new();
        for s in events
            .iter()
            .filter(|s| s.event.project_id == project_id && in_range(&s.event, &from, &to))
        {
            let day = s.event.timestamp.format("%Y-%m-%d").to_string();
            let entry = days.entry(day).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += s.event.cost_usd;
        }

        let mut points: Vec<serde_json::Value> = days
            .into_iter()
            .map(|(day, (count, cost))| {
                serde_json::json!({ "date": day, "events": count, "cost_usd": cost })
            })
            .collect();
        points.sort_by(|a, b| a["date"].as_str().cmp(&b["date"].as_str()));
        serde_json::json!({ "points": points })
    }

    async fn agents(&self, project_id: &str, only: Option<&str>) -> serde_json::Value {
        let events = self.events.read().await;
        let mut agents: HashMap<String, (u64, f64)> = HashMap::new();
        for s in events.iter().filter(|s| s.event.project_id == project_id) {
            if let Some(name) = agent_name(&s.event) {
                if only.map_or(true, |o| o == name) {
                    let entry = agents.entry(name.to_string()).or_insert((0, 0.0));
                    entry.0 += 1;
                    entry.1 += s.event.cost_usd;
                }
            }
        }

        let mut rows: Vec<serde_json::Value> = agents
            .into_iter()
            .map(|(name, (steps, cost))| {
                serde_json::json!({ "agent": name, "steps": steps, "cost_usd": cost })
            })
            .collect();
        rows.sort_by(|a, b| a["agent"].as_str().cmp(&b["agent"].as_str()));
        serde_json::json!({ "agents": rows })
    }

    async fn agent_timeseries(&self, project_id: &str, name: &str) -> serde_json::Value {
        let events = self.events.read().await;
        let mut days: HashMap<String, u64> = HashMap::new();
        for s in events
            .iter()
            .filter(|s| s.event.project_id == project_id && agent_name(&s.event) == Some(name))
        {
            *days
                .entry(s.event.timestamp.format("%Y-%m-%d").to_string())
                .or_insert(0) += 1;
        }
        let mut points: Vec<serde_json::Value> = days
            .into_iter()
            .map(|(day, count)| serde_json::json!({ "date": day, "steps": count }))
            .collect();
        points.sort_by(|a, b| a["date"].as_str().cmp(&b["date"].as_str()));
        serde_json::json!({ "agent": name, "points": points })
    }

    async fn roi_report(&self, project_id: &str) -> serde_json::Value {
        let events = self.events.read().await;
        let mut saved = 0.0;
        let mut spent = 0.0;
        let mut by_decision: HashMap<&'static str, u64> = HashMap::new();
        for s in events.iter().filter(|s| s.event.project_id == project_id) {
            spent += s.event.cost_usd;
            saved += s.event.potential_cost_usd - s.event.cost_usd;
            *by_decision.entry(s.event.cache_decision.as_str()).or_insert(0) += 1;
        }
        serde_json::json!({
            "spent_usd": spent,
            "saved_usd": saved,
            "decisions": by_decision,
        })
    }

    async fn streaming(&self, project_id: &str) -> serde_json::Value {
        let events = self.events.read().await;
        let streaming = events
            .iter()
            .filter(|s| {
                s.event.project_id == project_id && s.event.tags.iter().any(|t| t == "streaming")
            })
            .count() as u64;
        serde_json::json!({ "streaming_requests": streaming })
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn write_event(&self, event: &NormalizedEvent) -> anyhow::Result<()> {
        let mut events = self.events.write().await;
        // Events are immutable once emitted; a duplicate id is a re-delivery
        // and is ignored.
        if events.iter().any(|s| s.event.event_id == event.event_id) {
            return Ok(());
        }
        events.push(StoredEvent { event: event.clone(), flagged: false });
        Ok(())
    }

    async fn fetch_event(
        &self,
        project_id: &str,
        event_id: &str,
    ) -> anyhow::Result<Option<StoredEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .find(|s| s.event.project_id == project_id && s.event.event_id == event_id)
            .cloned())
    }

    async fn mark_flagged(&self, project_id: &str, event_id: &str) -> anyhow::Result<()> {
        let mut events = self.events.write().await;
        if let Some(stored) = events
            .iter_mut()
            .find(|s| s.event.project_id == project_id && s.event.event_id == event_id)
        {
            stored.flagged = true;
        }
        Ok(())
    }

    async fn query(
        &self,
        project_id: &str,
        query: AnalyticsQuery,
    ) -> anyhow::Result<serde_json::Value> {
        let value = match query {
            AnalyticsQuery::Stats { date_from, date_to } => {
                self.stats(project_id, date_from, date_to).await
            }
            AnalyticsQuery::Logs { limit } => {
                let events = self.events.read().await;
                let logs: Vec<&StoredEvent> = events
                    .iter()
                    .filter(|s| s.event.project_id == project_id)
                    .rev()
                    .take(limit)
                    .collect();
                serde_json::json!({ "logs": logs })
            }
            AnalyticsQuery::Timeseries { date_from, date_to } => {
                self.timeseries(project_id, date_from, date_to).await
            }
            AnalyticsQuery::Agents => self.agents(project_id, None).await,
            AnalyticsQuery::AgentDetail { name } => self.agents(project_id, Some(&name)).await,
            AnalyticsQuery::AgentTimeseries { name } => {
                self.agent_timeseries(project_id, &name).await
            }
            AnalyticsQuery::RoiReport => self.roi_report(project_id).await,
            AnalyticsQuery::Streaming => self.streaming(project_id).await,
        };
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// HTTP sink
// ---------------------------------------------------------------------------

/// Client for an external analytics sink. Writes are fire-and-forget from
/// the emitter's perspective; reads are passed through unchanged.
pub struct HttpAnalyticsSink {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpAnalyticsSink {
    pub fn new(client: reqwest::Client, base_url: &str) -> anyhow::Result<Self> {
        Ok(Self { client, base_url: Url::parse(base_url)? })
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn get_json(&self, url: Url) -> anyhow::Result<serde_json::Value> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("analytics sink returned {}", status);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl EventSink for HttpAnalyticsSink {
    async fn write_event(&self, event: &NormalizedEvent) -> anyhow::Result<()> {
        let url = self.endpoint("events")?;
        let response = self.client.post(url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("analytics sink returned {}", status);
        }
        debug!(event_id = %event.event_id, "event written to analytics sink");
        Ok(())
    }

    async fn fetch_event(
        &self,
        project_id: &str,
        event_id: &str,
    ) -> anyhow::Result<Option<StoredEvent>> {
        let mut url = self.endpoint(&format!("events/{event_id}"))?;
        url.query_pairs_mut().append_pair("project_id", project_id);
        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("analytics sink returned {}", status);
        }
        Ok(Some(response.json().await?))
    }

    async fn mark_flagged(&self, project_id: &str, event_id: &str) -> anyhow::Result<()> {
        let mut url = self.endpoint(&format!("events/{event_id}/flag"))?;
        url.query_pairs_mut().append_pair("project_id", project_id);
        let response = self.client.post(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("analytics sink returned {}", status);
        }
        Ok(())
    }

    async fn query(
        &self,
        project_id: &str,
        query: AnalyticsQuery,
    ) -> anyhow::Result<serde_json::Value> {
        let mut url = match &query {
            AnalyticsQuery::Stats { .. } => self.endpoint("stats")?,
            AnalyticsQuery::Logs { .. } => self.endpoint("logs")?,
            AnalyticsQuery::Timeseries { .. } => self.endpoint("timeseries")?,
            AnalyticsQuery::Agents => self.endpoint("agents")?,
            AnalyticsQuery::AgentDetail { name } => self.endpoint(&format!("agents/{name}"))?,
            AnalyticsQuery::AgentTimeseries { name } => {
                self.endpoint(&format!("agents/{name}/timeseries"))?
            }
            AnalyticsQuery::RoiReport => self.endpoint("roi-report")?,
            AnalyticsQuery::Streaming => self.endpoint("streaming")?,
        };
        url.query_pairs_mut().append_pair("project_id", project_id);

        match &query {
            AnalyticsQuery::Stats { date_from, date_to }
            | AnalyticsQuery::Timeseries { date_from, date_to } => {
                if let Some(from) = date_from {
                    url.query_pairs_mut().append_pair("date_from", &from.to_rfc3339());
                }
                if let Some(to) = date_to {
                    url.query_pairs_mut().append_pair("date_to", &to.to_rfc3339());
                }
            }
            AnalyticsQuery::Logs { limit } => {
                url.query_pairs_mut().append_pair("limit", &limit.to_string());
            }
            _ => {}
        }

        self.get_json(url).await
    }
}
