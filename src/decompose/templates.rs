//! Keyword-matched decomposition templates.
//!
//! Objectives route to a fixed template when any keyword matches; anything
//! unrecognized decomposes into a single subtask carrying the raw objective.

use super::types::DependencyKind;

/// One step of a template. `key` is stable within the template and used to
/// wire edges and derive subtask ids.
#[derive(Debug, Clone)]
pub struct TemplateStep {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub capabilities: &'static [&'static str],
    pub minutes: u32,
}

/// A fixed decomposition pattern for a family of objectives.
#[derive(Debug, Clone)]
pub struct ObjectiveTemplate {
    pub name: &'static str,
    pub keywords: &'static [&'static str],
    pub steps: &'static [TemplateStep],
    pub edges: &'static [(&'static str, &'static str, DependencyKind)],
}

impl ObjectiveTemplate {
    pub fn matches(&self, objective: &str) -> bool {
        let lower = objective.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k))
    }
}

/// Workshop/governance objectives: two parallel analysis roots feeding
/// planning, which gates coordination.
static WORKSHOP_TEMPLATE: ObjectiveTemplate = ObjectiveTemplate {
    name: "workshop",
    keywords: &["workshop", "governance"],
    steps: &[
        TemplateStep {
            key: "data-analysis",
            name: "data-analysis",
            description: "Assess data quality and analyze requirements for the objective",
            capabilities: &["assess-data-quality", "analyze-requirements"],
            minutes: 45,
        },
        TemplateStep {
            key: "infrastructure",
            name: "infrastructure",
            description: "Provision and configure the supporting infrastructure",
            capabilities: &["provision-infrastructure", "configure-environment"],
            minutes: 30,
        },
        TemplateStep {
            key: "planning",
            name: "planning",
            description: "Plan the workshop agenda from analysis and infrastructure inputs",
            capabilities: &["plan-workshop", "design-agenda"],
            minutes: 60,
        },
        TemplateStep {
            key: "coordination",
            name: "coordination",
            description: "Coordinate participants and schedule the planned sessions",
            capabilities: &["coordinate-participants", "schedule-sessions"],
            minutes: 30,
        },
    ],
    edges: &[
        ("data-analysis", "planning", DependencyKind::Sequential),
        ("infrastructure", "planning", DependencyKind::Parallel),
        ("planning", "coordination", DependencyKind::Sequential),
    ],
};

static DATA_TEMPLATE: ObjectiveTemplate = ObjectiveTemplate {
    name: "data-analysis",
    keywords: &["data", "analysis", "quality"],
    steps: &[
        TemplateStep {
            key: "collect",
            name: "collect-data",
            description: "Collect and stage the source data sets",
            capabilities: &["collect-data", "query-database"],
            minutes: 30,
        },
        TemplateStep {
            key: "analyze",
            name: "analyze-data",
            description: "Run the analysis over the staged data",
            capabilities: &["analyze-data", "assess-data-quality"],
            minutes: 60,
        },
        TemplateStep {
            key: "validate",
            name: "validate-findings",
            description: "Validate findings against the source data",
            capabilities: &["validate-findings"],
            minutes: 30,
        },
    ],
    edges: &[
        ("collect", "analyze", DependencyKind::Sequential),
        ("analyze", "validate", DependencyKind::Sequential),
    ],
};

static REPORT_TEMPLATE: ObjectiveTemplate = ObjectiveTemplate {
    name: "reporting",
    keywords: &["report", "document", "summary"],
    steps: &[
        TemplateStep {
            key: "gather",
            name: "gather-content",
            description: "Gather source material for the report",
            capabilities: &["gather-content"],
            minutes: 30,
        },
        TemplateStep {
            key: "draft",
            name: "draft-report",
            description: "Draft the report from gathered content",
            capabilities: &["draft-report", "generate-document"],
            minutes: 45,
        },
        TemplateStep {
            key: "review",
            name: "review-report",
            description: "Review and finalize the drafted report",
            capabilities: &["review-report"],
            minutes: 20,
        },
    ],
    edges: &[
        ("gather", "draft", DependencyKind::Sequential),
        ("draft", "review", DependencyKind::Sequential),
    ],
};

/// Built-in templates in match-precedence order. The workshop template comes
/// first so "plan governance workshop" does not fall through to the data
/// template via unrelated keyword overlap.
static TEMPLATES: [&ObjectiveTemplate; 3] = [&WORKSHOP_TEMPLATE, &DATA_TEMPLATE, &REPORT_TEMPLATE];

pub(crate) fn builtin_templates() -> &'static [&'static ObjectiveTemplate] {
    &TEMPLATES
}
