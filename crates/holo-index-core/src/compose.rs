//! Output composition: turns per-component results into one ordered,
//! deduplicated, size-bounded answer.
//!
//! [`compose`] is pure. Section order depends on the intent; empty sections
//! are omitted and the `warnings` section (component failures, timeouts and
//! degradations) always comes last.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::index::SearchHit;
use crate::models::{Component, ComponentStatus, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// At most three entries per section, no snippets.
    Minimal,
    #[default]
    Standard,
    /// Adds a per-component timing section.
    Verbose,
}

impl Verbosity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Verbosity::Minimal),
            "standard" => Some(Verbosity::Standard),
            "verbose" => Some(Verbosity::Verbose),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
    pub component: Component,
}

/// Everything one component produced for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentResult {
    pub component: Component,
    pub status: ComponentStatus,
    pub elapsed_ms: u64,
    pub hits: Vec<SearchHit>,
    /// Free-text lines: engine answers or per-entity health summaries.
    pub insights: Vec<String>,
    pub alerts: Vec<Alert>,
    /// Failure or degradation reason.
    pub detail: Option<String>,
}

impl ComponentResult {
    pub fn new(component: Component, status: ComponentStatus) -> Self {
        Self {
            component,
            status,
            elapsed_ms: 0,
            hits: Vec::new(),
            insights: Vec::new(),
            alerts: Vec::new(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Findings,
    Documentation,
    Guidance,
    Health,
    Insights,
    Alerts,
    Components,
    Warnings,
}

impl SectionKind {
    pub fn title(&self) -> &'static str {
        match self {
            SectionKind::Findings => "Findings",
            SectionKind::Documentation => "Documentation",
            SectionKind::Guidance => "Guidance",
            SectionKind::Health => "Health",
            SectionKind::Insights => "Insights",
            SectionKind::Alerts => "Alerts",
            SectionKind::Components => "Components",
            SectionKind::Warnings => "Warnings",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// How many raw items collapsed into this entry.
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub title: String,
    pub entries: Vec<Entry>,
    /// Entries dropped by the per-section cap.
    pub truncated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComposeLimits {
    pub max_entries_per_section: usize,
}

impl Default for ComposeLimits {
    fn default() -> Self {
        Self {
            max_entries_per_section: 10,
        }
    }
}

const MINIMAL_CAP: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedOutput {
    pub intent: Intent,
    pub confidence: f64,
    pub sections: Vec<Section>,
    /// A fallback path produced some of the content.
    pub degraded: bool,
    /// At least one component timed out or failed.
    pub partial: bool,
}

impl ComposedOutput {
    pub fn section(&self, kind: SectionKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// Entity ids shown in any hit-bearing section, first appearance order.
    pub fn surfaced_entities(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for section in &self.sections {
            for entry in &section.entries {
                if let Some(id) = &entry.entity_id {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
            }
        }
        ids
    }
}

impl fmt::Display for ComposedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {:.2}]", self.intent, self.confidence)?;
        if self.degraded {
            write!(f, " degraded")?;
        }
        if self.partial {
            write!(f, " partial")?;
        }
        writeln!(f)?;
        for section in &self.sections {
            writeln!(f, "\n## {}", section.title)?;
            for entry in &section.entries {
                match (entry.severity, entry.score) {
                    (Some(sev), _) => write!(f, "- [{}] {}", sev, entry.text)?,
                    (None, Some(score)) => write!(f, "- {:.3}  {}", score, entry.text)?,
                    (None, None) => write!(f, "- {}", entry.text)?,
                }
                if entry.count > 1 {
                    write!(f, " (x{})", entry.count)?;
                }
                writeln!(f)?;
                if let Some(snippet) = &entry.snippet {
                    writeln!(f, "    {}", snippet.replace('\n', " "))?;
                }
            }
            if section.truncated > 0 {
                writeln!(f, "  ... {} more", section.truncated)?;
            }
        }
        Ok(())
    }
}

fn section_order(intent: Intent) -> &'static [SectionKind] {
    use SectionKind::*;
    match intent {
        Intent::DocLookup => &[Documentation, Guidance, Findings, Insights, Health, Alerts],
        Intent::CodeLocation => &[Findings, Health, Documentation, Guidance, Insights, Alerts],
        Intent::ModuleHealth => &[Health, Alerts, Findings, Insights, Documentation, Guidance],
        Intent::Research => &[Insights, Findings, Documentation, Guidance, Health, Alerts],
        Intent::General => &[Findings, Documentation, Insights, Guidance, Health, Alerts],
    }
}

fn hit_section(component: Component) -> Option<SectionKind> {
    match component {
        Component::VectorSearch => Some(SectionKind::Findings),
        Component::DocSearch => Some(SectionKind::Documentation),
        Component::WspGuidance => Some(SectionKind::Guidance),
        _ => None,
    }
}

fn insight_section(component: Component) -> SectionKind {
    match component {
        Component::HealthAnalysis => SectionKind::Health,
        _ => SectionKind::Insights,
    }
}

/// Lowercased, whitespace-collapsed message without trailing punctuation.
pub fn normalize_message(message: &str) -> String {
    message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', '!', ':', ';'])
        .to_lowercase()
}

/// Merge alerts with the same normalized message: one entry with a count and
/// the highest severity. Sorted by severity (desc), then first appearance.
pub fn dedup_alerts(alerts: &[Alert]) -> Vec<Entry> {
    dedup_messages(alerts.iter().map(|a| (a.severity, a.message.as_str())))
}

fn dedup_messages<'a>(messages: impl IntoIterator<Item = (Severity, &'a str)>) -> Vec<Entry> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<(Severity, usize, Entry)> = Vec::new();
    for (severity, message) in messages {
        let key = normalize_message(message);
        if key.is_empty() {
            continue;
        }
        match index.get(&key) {
            Some(&i) => {
                let (sev, _, entry) = &mut merged[i];
                entry.count += 1;
                if severity > *sev {
                    *sev = severity;
                    entry.severity = Some(severity);
                }
            }
            None => {
                index.insert(key, merged.len());
                let order = merged.len();
                merged.push((
                    severity,
                    order,
                    Entry {
                        text: message.trim().to_string(),
                        severity: Some(severity),
                        count: 1,
                        ..Entry::default()
                    },
                ));
            }
        }
    }
    merged.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    merged.into_iter().map(|(_, _, e)| e).collect()
}

/// Best-similarity hit per entity, sorted by similarity (desc) then id.
fn dedup_hits<'a>(hits: impl Iterator<Item = &'a SearchHit>) -> Vec<Entry> {
    let mut best: HashMap<&str, &SearchHit> = HashMap::new();
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for hit in hits {
        *counts.entry(hit.entity_id.as_str()).or_insert(0) += 1;
        best.entry(hit.entity_id.as_str())
            .and_modify(|cur| {
                if hit.similarity > cur.similarity {
                    *cur = hit;
                }
            })
            .or_insert(hit);
    }
    let mut hits: Vec<&SearchHit> = best.into_values().collect();
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    hits.into_iter()
        .map(|h| Entry {
            text: h.source_path.clone(),
            entity_id: Some(h.entity_id.clone()),
            source_path: Some(h.source_path.clone()),
            score: Some(h.similarity),
            snippet: if h.snippet.is_empty() {
                None
            } else {
                Some(h.snippet.clone())
            },
            severity: None,
            count: counts.get(h.entity_id.as_str()).copied().unwrap_or(1),
        })
        .collect()
}

fn warning_for(result: &ComponentResult) -> Option<(Severity, String)> {
    let detail = result.detail.as_deref().unwrap_or("no detail");
    let (severity, text) = match result.status {
        ComponentStatus::TimedOut => (
            Severity::Warning,
            format!("{} timed out after {}ms", result.component, result.elapsed_ms),
        ),
        ComponentStatus::Failed => (
            Severity::Warning,
            format!("{} failed: {}", result.component, detail),
        ),
        ComponentStatus::Degraded => (
            Severity::Info,
            format!("{} degraded: {}", result.component, detail),
        ),
        ComponentStatus::Completed | ComponentStatus::Skipped => return None,
    };
    Some((severity, text))
}

fn bounded_section(kind: SectionKind, mut entries: Vec<Entry>, cap: usize) -> Section {
    let truncated = entries.len().saturating_sub(cap);
    entries.truncate(cap);
    Section {
        kind,
        title: kind.title().to_string(),
        entries,
        truncated,
    }
}

/// Compose component results into an ordered, bounded answer.
pub fn compose(
    intent: Intent,
    confidence: f64,
    results: &[ComponentResult],
    verbosity: Verbosity,
    limits: &ComposeLimits,
) -> ComposedOutput {
    let cap = match verbosity {
        Verbosity::Minimal => limits.max_entries_per_section.min(MINIMAL_CAP),
        _ => limits.max_entries_per_section,
    };

    let mut bodies: HashMap<SectionKind, Vec<Entry>> = HashMap::new();

    for kind in [
        SectionKind::Findings,
        SectionKind::Documentation,
        SectionKind::Guidance,
    ] {
        let hits = results
            .iter()
            .filter(|r| hit_section(r.component) == Some(kind))
            .flat_map(|r| r.hits.iter());
        bodies.insert(kind, dedup_hits(hits));
    }

    for r in results {
        let kind = insight_section(r.component);
        for line in &r.insights {
            bodies.entry(kind).or_default().push(Entry {
                text: line.clone(),
                count: 1,
                ..Entry::default()
            });
        }
    }

    let alerts: Vec<Alert> = results.iter().flat_map(|r| r.alerts.iter().cloned()).collect();
    bodies.insert(SectionKind::Alerts, dedup_alerts(&alerts));

    let mut sections: Vec<Section> = Vec::new();
    for &kind in section_order(intent) {
        let mut entries = bodies.remove(&kind).unwrap_or_default();
        if entries.is_empty() {
            continue;
        }
        if verbosity == Verbosity::Minimal {
            for e in &mut entries {
                e.snippet = None;
            }
        }
        sections.push(bounded_section(kind, entries, cap));
    }

    if verbosity == Verbosity::Verbose && !results.is_empty() {
        let entries = results
            .iter()
            .map(|r| Entry {
                text: format!("{} {} in {}ms", r.component, r.status.as_str(), r.elapsed_ms),
                count: 1,
                ..Entry::default()
            })
            .collect();
        sections.push(bounded_section(SectionKind::Components, entries, cap));
    }

    let warnings: Vec<(Severity, String)> = results.iter().filter_map(warning_for).collect();
    if !warnings.is_empty() {
        let entries = dedup_messages(warnings.iter().map(|(sev, text)| (*sev, text.as_str())));
        sections.push(bounded_section(SectionKind::Warnings, entries, cap));
    }

    ComposedOutput {
        intent,
        confidence,
        sections,
        degraded: results
            .iter()
            .any(|r| r.status == ComponentStatus::Degraded),
        partial: results
            .iter()
            .any(|r| matches!(r.status, ComponentStatus::TimedOut | ComponentStatus::Failed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    fn hit(id: &str, sim: f64) -> SearchHit {
        SearchHit {
            entity_id: id.to_string(),
            kind: EntityKind::CodeSymbol,
            source_path: format!("src/{}.rs", id),
            similarity: sim,
            snippet: format!("fn {}()", id),
        }
    }

    fn search(component: Component, hits: Vec<SearchHit>) -> ComponentResult {
        ComponentResult {
            hits,
            ..ComponentResult::new(component, ComponentStatus::Completed)
        }
    }

    fn alert(sev: Severity, msg: &str) -> Alert {
        Alert {
            severity: sev,
            message: msg.to_string(),
            component: Component::HealthAnalysis,
        }
    }

    #[test]
    fn test_findings_dedup_keeps_best() {
        let results = vec![search(
            Component::VectorSearch,
            vec![hit("a", 0.4), hit("b", 0.7), hit("a", 0.9)],
        )];
        let out = compose(
            Intent::CodeLocation,
            1.0,
            &results,
            Verbosity::Standard,
            &ComposeLimits::default(),
        );
        let findings = out.section(SectionKind::Findings).unwrap();
        assert_eq!(findings.entries.len(), 2);
        assert_eq!(findings.entries[0].entity_id.as_deref(), Some("a"));
        assert_eq!(findings.entries[0].score, Some(0.9));
        assert_eq!(findings.entries[0].count, 2);
        assert_eq!(out.sections[0].kind, SectionKind::Findings);
        assert!(!out.degraded && !out.partial);
    }

    #[test]
    fn test_alerts_dedup_to_highest_severity() {
        let alerts = vec![
            alert(Severity::Info, "Module too large."),
            alert(Severity::Critical, "module   too large"),
            alert(Severity::Warning, "missing docs"),
        ];
        let entries = dedup_alerts(&alerts);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].severity, Some(Severity::Critical));
        assert_eq!(entries[0].count, 2);
        assert_eq!(entries[0].text, "Module too large.");
        assert_eq!(entries[1].text, "missing docs");
    }

    #[test]
    fn test_minimal_caps_and_drops_snippets() {
        let hits = (0..8).map(|i| hit(&format!("e{}", i), 0.1 * i as f64)).collect();
        let results = vec![search(Component::VectorSearch, hits)];
        let out = compose(
            Intent::General,
            0.5,
            &results,
            Verbosity::Minimal,
            &ComposeLimits::default(),
        );
        let findings = out.section(SectionKind::Findings).unwrap();
        assert_eq!(findings.entries.len(), 3);
        assert_eq!(findings.truncated, 5);
        assert!(findings.entries.iter().all(|e| e.snippet.is_none()));
    }

    #[test]
    fn test_failures_become_warnings() {
        let results = vec![
            search(Component::VectorSearch, vec![hit("a", 0.5)]),
            ComponentResult {
                elapsed_ms: 2000,
                ..ComponentResult::new(Component::FastReasoner, ComponentStatus::TimedOut)
            },
            ComponentResult::new(Component::DocSearch, ComponentStatus::Degraded)
                .with_detail("lexical fallback"),
        ];
        let out = compose(
            Intent::General,
            0.5,
            &results,
            Verbosity::Standard,
            &ComposeLimits::default(),
        );
        assert!(out.degraded);
        assert!(out.partial);
        let warnings = out.sections.last().unwrap();
        assert_eq!(warnings.kind, SectionKind::Warnings);
        assert_eq!(warnings.entries.len(), 2);
        assert!(warnings.entries[0].text.contains("timed out after 2000ms"));
    }

    #[test]
    fn test_warnings_are_deduplicated_and_capped() {
        let mut results: Vec<ComponentResult> = (0..6)
            .map(|i| {
                ComponentResult::new(Component::DocSearch, ComponentStatus::Failed)
                    .with_detail(format!("shard {} unreachable", i))
            })
            .collect();
        results.push(
            ComponentResult::new(Component::DocSearch, ComponentStatus::Failed)
                .with_detail("shard 0 unreachable."),
        );
        let out = compose(
            Intent::General,
            0.5,
            &results,
            Verbosity::Minimal,
            &ComposeLimits::default(),
        );
        let warnings = out.section(SectionKind::Warnings).unwrap();
        assert_eq!(warnings.entries.len(), MINIMAL_CAP);
        assert_eq!(warnings.truncated, 3);
        assert_eq!(warnings.entries[0].text, "doc-search failed: shard 0 unreachable");
        assert_eq!(warnings.entries[0].count, 2);
    }

    #[test]
    fn test_section_order_follows_intent() {
        let results = vec![
            search(Component::VectorSearch, vec![hit("a", 0.5)]),
            search(Component::DocSearch, vec![hit("d", 0.5)]),
        ];
        let out = compose(
            Intent::DocLookup,
            0.9,
            &results,
            Verbosity::Standard,
            &ComposeLimits::default(),
        );
        assert_eq!(out.sections[0].kind, SectionKind::Documentation);
        assert_eq!(out.sections[1].kind, SectionKind::Findings);
        assert_eq!(out.surfaced_entities(), vec!["d".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_verbose_adds_component_timings() {
        let results = vec![search(Component::VectorSearch, vec![])];
        let out = compose(
            Intent::General,
            0.5,
            &results,
            Verbosity::Verbose,
            &ComposeLimits::default(),
        );
        assert!(out.section(SectionKind::Components).is_some());
        assert!(out.section(SectionKind::Findings).is_none());
    }

    #[test]
    fn test_display_renders_flags() {
        let results = vec![ComponentResult::new(Component::VectorSearch, ComponentStatus::Failed)
            .with_detail("boom")];
        let out = compose(
            Intent::General,
            0.5,
            &results,
            Verbosity::Standard,
            &ComposeLimits::default(),
        );
        let text = out.to_string();
        assert!(text.contains("partial"));
        assert!(text.contains("vector-search failed: boom"));
    }
}
