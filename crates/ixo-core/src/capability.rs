//! Capability index: the static advertisement of known intents.
//!
//! Loaded once at startup and never mutated. Each entry maps an intent
//! name to metadata plus a template id; templates are parameterized
//! program sources owned by the index. A lookup miss is a soft "unknown",
//! not a failure - the orchestrator decides what unknown means per mode.
//!
//! The index also renders an ultra-compact manifest so a model can
//! discover what exists without loading full schemas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Intent category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Read-only lookups.
    Query,
    /// State-changing operations.
    Mutation,
    /// Derived computation over fetched data.
    Analysis,
}

/// Rough execution complexity, used for manifest cost hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Single call, no data dependencies.
    Simple,
    /// A handful of calls or light post-processing.
    Medium,
    /// Multi-step programs with control flow.
    Complex,
}

impl Complexity {
    /// Token-cost hint carried in the compact manifest.
    #[must_use]
    pub const fn cost_hint(self) -> u32 {
        match self {
            Self::Simple => 100,
            Self::Medium => 300,
            Self::Complex => 600,
        }
    }
}

/// Metadata for one known intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityEntry {
    /// Intent name clients submit.
    pub name: String,
    /// Category of the operation.
    pub category: Category,
    /// Complexity class.
    pub complexity: Complexity,
    /// Template this intent materializes.
    pub template_id: String,
}

/// Static mapping from intent names to entries and templates.
#[derive(Debug, Clone, Default)]
pub struct CapabilityIndex {
    entries: HashMap<String, CapabilityEntry>,
    templates: HashMap<String, String>,
}

/// Builder for assembling an index at startup.
#[derive(Debug, Default)]
pub struct CapabilityIndexBuilder {
    index: CapabilityIndex,
}

impl CapabilityIndexBuilder {
    /// Registers a template body under an id.
    #[must_use]
    pub fn template(mut self, id: impl Into<String>, body: impl Into<String>) -> Self {
        self.index.templates.insert(id.into(), body.into());
        self
    }

    /// Registers an intent entry.
    #[must_use]
    pub fn intent(
        mut self,
        name: impl Into<String>,
        category: Category,
        complexity: Complexity,
        template_id: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.index.entries.insert(
            name.clone(),
            CapabilityEntry {
                name,
                category,
                complexity,
                template_id: template_id.into(),
            },
        );
        self
    }

    /// Finishes the build.
    #[must_use]
    pub fn build(self) -> CapabilityIndex {
        self.index
    }
}

impl CapabilityIndex {
    /// Starts an empty builder.
    #[must_use]
    pub fn builder() -> CapabilityIndexBuilder {
        CapabilityIndexBuilder::default()
    }

    /// The built-in index: a small set of service intents plus the `echo`
    /// smoke-test intent.
    #[must_use]
    pub fn builtin() -> Self {
        Self::builder()
            .template("echo", "print({message})\n")
            .template(
                "list_errors",
                "import service\nfor issue in service.issues(limit={limit}):\n    print(issue.id, issue.title)\n",
            )
            .template(
                "analyze_error",
                "import service\ntrace = service.trace({error_id})\nprint(trace.filename, trace.line_no, trace.cause())\n",
            )
            .template(
                "create_issue",
                "import service\nissue = service.create_issue(title={title}, body={body})\nprint(issue.url)\n",
            )
            .intent("echo", Category::Query, Complexity::Simple, "echo")
            .intent("list_errors", Category::Query, Complexity::Simple, "list_errors")
            .intent(
                "analyze_error",
                Category::Analysis,
                Complexity::Medium,
                "analyze_error",
            )
            .intent(
                "create_issue",
                Category::Mutation,
                Complexity::Medium,
                "create_issue",
            )
            .build()
    }

    /// Looks up an intent. `None` is a soft miss.
    #[must_use]
    pub fn lookup(&self, intent: &str) -> Option<&CapabilityEntry> {
        self.entries.get(intent)
    }

    /// Resolves a template body by id.
    #[must_use]
    pub fn template(&self, template_id: &str) -> Option<&str> {
        self.templates.get(template_id).map(String::as_str)
    }

    /// Resolves an intent straight to its template body.
    #[must_use]
    pub fn template_for(&self, intent: &str) -> Option<&str> {
        self.lookup(intent)
            .and_then(|e| self.template(&e.template_id))
    }

    /// Number of registered intents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the compact discovery manifest.
    ///
    /// The shape is deliberately terse - single-letter keys, one cost
    /// hint per intent - so the whole advertisement stays small enough to
    /// hand to a model verbatim. Entries are sorted by name so the output
    /// is deterministic.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        let mut caps: Vec<ManifestEntry> = self
            .entries
            .values()
            .map(|e| ManifestEntry {
                i: e.name.clone(),
                c: match e.category {
                    Category::Query => "query",
                    Category::Mutation => "mutation",
                    Category::Analysis => "analysis",
                }
                .to_string(),
                t: e.complexity.cost_hint(),
            })
            .collect();
        caps.sort_by(|a, b| a.i.cmp(&b.i));
        let mut manifest = Manifest {
            v: 1,
            caps,
            tokens: 0,
        };
        // 4 bytes per token, matching the orchestrator's estimator.
        let rendered = serde_json::to_string(&manifest).unwrap_or_default();
        manifest.tokens = (rendered.len() / 4) as u32;
        manifest
    }
}

/// Compact discovery manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest format version.
    pub v: u32,
    /// One entry per intent.
    pub caps: Vec<ManifestEntry>,
    /// Estimated token cost of the manifest itself.
    pub tokens: u32,
}

/// One manifest row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Intent name.
    pub i: String,
    /// Category label.
    pub c: String,
    /// Token-cost hint for materializing and running this intent.
    pub t: u32,
}
