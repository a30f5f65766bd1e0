//! Context retrieval for agent prompts.
//!
//! None of these operations return an error: access denial yields an
//! empty result, and internal failures are logged and degrade to the
//! "no context available" marker.

use std::collections::HashSet;

use tracing::Instrument;

use context_memory_core::access::{Action, AuditOutcome};
use context_memory_core::budget::{no_context_marker, ContextAssembler, SEPARATOR};
use context_memory_core::models::MetadataFilter;
use context_memory_core::Result;

use crate::engine::MemoryEngine;

impl MemoryEngine {
    /// Top-`k` chunks for `query`, joined with blank lines.
    pub async fn get_context(
        &self,
        query: &str,
        k: usize,
        user: Option<&str>,
        metadata_filter: Option<&MetadataFilter>,
    ) -> String {
        let _span = self.profiler.span("get_context");
        if !self.guard.authorize(user, Action::Read, "get_context").is_allowed() {
            return String::new();
        }
        let query = self.clean_input(query);
        let filter = metadata_filter.cloned().unwrap_or_default();
        match self.search(&query, k, &filter).await {
            Ok(hits) => hits
                .into_iter()
                .map(|h| h.text)
                .collect::<Vec<_>>()
                .join(SEPARATOR),
            Err(e) => {
                tracing::warn!(error = %e, "get_context failed");
                self.guard
                    .audit()
                    .record(user, Action::Read, "get_context", AuditOutcome::Failed);
                no_context_marker(&[query])
            }
        }
    }

    /// Up to `max_results` chunk texts per domain, in domain order, with
    /// chunks shared between domains listed once.
    pub async fn get_context_by_domains(
        &self,
        domains: &[String],
        max_results: usize,
        user: Option<&str>,
    ) -> Vec<String> {
        let _span = self.profiler.span("get_context_by_domains");
        if !self
            .guard
            .authorize(user, Action::Read, "get_context_by_domains")
            .is_allowed()
        {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for domain in domains {
            let query = self.clean_input(domain);
            match self.search(&query, max_results, &MetadataFilter::new()).await {
                Ok(hits) => {
                    for hit in hits {
                        if seen.insert(hit.chunk_key) {
                            out.push(hit.text);
                        }
                    }
                }
                Err(e) => tracing::warn!(domain = %domain, error = %e, "domain lookup failed"),
            }
        }
        out
    }

    /// Assemble context across `topics` under a global token budget.
    ///
    /// Topics are visited in order, each contributing up to
    /// `max_per_topic` chunks. Chunks are admitted whole; only a first
    /// chunk larger than the entire budget is truncated. Returns the
    /// marker string naming the topics when nothing was found.
    pub async fn build_focused_context(
        &self,
        topics: &[String],
        max_tokens: usize,
        max_per_topic: usize,
        user: Option<&str>,
        task_id: Option<&str>,
        agent_role: Option<&str>,
    ) -> String {
        let span = tracing::info_span!(
            "build_focused_context",
            task_id = ?task_id,
            agent_role = ?agent_role,
            topics = topics.len(),
            max_tokens,
        );
        async move {
            let _timer = self.profiler.span("build_focused_context");
            if !self
                .guard
                .authorize(user, Action::Read, "build_focused_context")
                .is_allowed()
            {
                return String::new();
            }
            match self.assemble_topics(topics, max_tokens, max_per_topic).await {
                Ok(Some(context)) => context,
                Ok(None) => no_context_marker(topics),
                Err(e) => {
                    tracing::warn!(error = %e, "context assembly failed");
                    self.guard.audit().record(
                        user,
                        Action::Read,
                        "build_focused_context",
                        AuditOutcome::Failed,
                    );
                    no_context_marker(topics)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn assemble_topics(
        &self,
        topics: &[String],
        max_tokens: usize,
        max_per_topic: usize,
    ) -> Result<Option<String>> {
        let mut assembler = ContextAssembler::new(self.estimator.as_ref(), max_tokens);
        if max_tokens == 0 {
            return Ok(None);
        }
        'topics: for topic in topics {
            let query = self.clean_input(topic);
            let hits = self
                .search(&query, max_per_topic, &MetadataFilter::new())
                .await?;
            tracing::debug!(topic = %query, hits = hits.len(), "topic retrieved");
            for hit in hits {
                assembler.offer(&hit.chunk_key, &hit.text);
                if assembler.is_full() {
                    break 'topics;
                }
            }
        }
        if assembler.is_empty() {
            Ok(None)
        } else {
            tracing::debug!(chunks = assembler.len(), tokens = assembler.used_tokens(), "context assembled");
            Ok(Some(assembler.finish()))
        }
    }
}
