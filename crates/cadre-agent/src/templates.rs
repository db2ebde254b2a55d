use crate::config::{AgentConfig, TraitMap};
use cadre_core::{OrganizationId, TemplateId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// A named archetype an agent configuration is built from.
///
/// The template decides which capabilities the agent offers to capability
/// selectors and which payload kinds it is willing to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub id: TemplateId,
    pub title: String,
    /// Standing instructions handed to the capability with every task.
    pub briefing: String,
    #[serde(default)]
    pub personality: TraitMap,
    #[serde(default)]
    pub goals: TraitMap,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Payload `kind` values this template accepts. Empty accepts any kind.
    #[serde(default)]
    pub accepted_kinds: Vec<String>,
}

impl AgentTemplate {
    /// Whether the template offers the named capability.
    pub fn offers(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Whether a payload of the given kind can be processed.
    pub fn accepts(&self, kind: &str) -> bool {
        self.accepted_kinds.is_empty() || self.accepted_kinds.iter().any(|k| k == kind)
    }

    /// Build a config for `organization_id` pre-filled with this template's
    /// default personality and goals.
    pub fn seed_config(
        &self,
        organization_id: impl Into<OrganizationId>,
        name: impl Into<String>,
    ) -> AgentConfig {
        let mut config = AgentConfig::new(organization_id, self.id.clone(), name);
        config.personality = self.personality.clone();
        config.goals = self.goals.clone();
        config
    }
}

/// Lookup table of templates known to the runtime.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<TemplateId, Arc<AgentTemplate>>,
}

impl TemplateRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in executive templates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for template in default_templates() {
            registry.register(template);
        }
        registry
    }

    /// Add or replace a template.
    pub fn register(&mut self, template: AgentTemplate) {
        self.templates
            .insert(template.id.clone(), Arc::new(template));
    }

    pub fn get(&self, id: &TemplateId) -> Option<Arc<AgentTemplate>> {
        self.templates.get(id).cloned()
    }

    /// All templates sorted by id.
    pub fn list(&self) -> Vec<Arc<AgentTemplate>> {
        let mut all: Vec<Arc<AgentTemplate>> = self.templates.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn traits(value: serde_json::Value) -> TraitMap {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => TraitMap::new(),
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// The built-in executive templates.
pub fn default_templates() -> Vec<AgentTemplate> {
    vec![
        ceo_template(),
        cfo_template(),
        cto_template(),
        cmo_template(),
        coo_template(),
    ]
}

fn ceo_template() -> AgentTemplate {
    AgentTemplate {
        id: TemplateId::new("ceo"),
        title: "Chief Executive Officer".to_string(),
        briefing: CEO_BRIEFING.to_string(),
        personality: traits(json!({
            "tone": "visionary",
            "focus": "company direction",
            "risk_appetite": "moderate",
        })),
        goals: traits(json!({
            "annual_growth_pct": 40,
            "strategic_priority": "market leadership",
        })),
        capabilities: strings(&["strategy", "planning", "leadership"]),
        accepted_kinds: strings(&["strategy_review", "okr_plan", "board_update", "decision"]),
    }
}

fn cfo_template() -> AgentTemplate {
    AgentTemplate {
        id: TemplateId::new("cfo"),
        title: "Chief Financial Officer".to_string(),
        briefing: CFO_BRIEFING.to_string(),
        personality: traits(json!({
            "tone": "analytical",
            "focus": "cash discipline",
            "risk_appetite": "low",
        })),
        goals: traits(json!({
            "runway_months": 18,
            "gross_margin_pct": 70,
        })),
        capabilities: strings(&["finance", "budgeting", "forecasting"]),
        accepted_kinds: strings(&["budget_review", "forecast", "expense_audit", "decision"]),
    }
}

fn cto_template() -> AgentTemplate {
    AgentTemplate {
        id: TemplateId::new("cto"),
        title: "Chief Technology Officer".to_string(),
        briefing: CTO_BRIEFING.to_string(),
        personality: traits(json!({
            "tone": "pragmatic",
            "focus": "engineering velocity",
            "risk_appetite": "moderate",
        })),
        goals: traits(json!({
            "uptime_pct": 99.9,
            "deploys_per_week": 10,
        })),
        capabilities: strings(&["engineering", "architecture", "security"]),
        accepted_kinds: strings(&["architecture_review", "incident_review", "roadmap", "decision"]),
    }
}

fn cmo_template() -> AgentTemplate {
    AgentTemplate {
        id: TemplateId::new("cmo"),
        title: "Chief Marketing Officer".to_string(),
        briefing: CMO_BRIEFING.to_string(),
        personality: traits(json!({
            "tone": "energetic",
            "focus": "brand and demand",
            "risk_appetite": "high",
        })),
        goals: traits(json!({
            "qualified_leads_per_month": 500,
            "brand_position": "category creator",
        })),
        capabilities: strings(&["marketing", "branding", "planning"]),
        accepted_kinds: strings(&["campaign_plan", "market_analysis", "decision"]),
    }
}

fn coo_template() -> AgentTemplate {
    AgentTemplate {
        id: TemplateId::new("coo"),
        title: "Chief Operating Officer".to_string(),
        briefing: COO_BRIEFING.to_string(),
        personality: traits(json!({
            "tone": "methodical",
            "focus": "operational excellence",
            "risk_appetite": "low",
        })),
        goals: traits(json!({
            "on_time_delivery_pct": 95,
            "process_maturity": "repeatable",
        })),
        capabilities: strings(&["operations", "hiring", "planning"]),
        // any kind
        accepted_kinds: Vec::new(),
    }
}

const CEO_BRIEFING: &str = "\
You are the CEO of the organization. Weigh every request against the \
company's long-term direction, name the trade-offs explicitly and end with \
a clear decision and its owner.";

const CFO_BRIEFING: &str = "\
You are the CFO of the organization. Ground every answer in numbers, state \
the assumptions behind them and flag anything that shortens runway.";

const CTO_BRIEFING: &str = "\
You are the CTO of the organization. Favor simple, operable systems, call \
out security and reliability risks, and estimate engineering effort.";

const CMO_BRIEFING: &str = "\
You are the CMO of the organization. Tie every proposal to audience, \
positioning and measurable demand, and propose how success is tracked.";

const COO_BRIEFING: &str = "\
You are the COO of the organization. Turn goals into owners, timelines and \
repeatable processes, and surface blockers early.";
