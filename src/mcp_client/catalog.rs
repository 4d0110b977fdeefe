//! Tool catalog.
//!
//! The backend's tool schemas as of the current running session. A
//! [`ToolSet`] is immutable once built; [`ToolCatalog`] keeps the latest one
//! keyed by the session generation it was fetched from, so a restart makes
//! the cached set stale without anyone having to clear it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::errors::McpError;
use super::types::{ToolCallRequest, ToolSchema};

// ─── ToolSet ─────────────────────────────────────────────────────────────────

/// Tool schemas advertised by one backend session, in advertised order.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<ToolSchema>,
    /// `tool_name → index into tools`.
    index: HashMap<String, usize>,
}

impl ToolSet {
    /// Build a set. Later duplicates of a name are dropped.
    pub fn new(tools: Vec<ToolSchema>) -> Self {
        let mut kept = Vec::with_capacity(tools.len());
        let mut index = HashMap::with_capacity(tools.len());
        for tool in tools {
            if index.contains_key(&tool.name) {
                tracing::warn!(tool = %tool.name, "backend advertised a tool twice, keeping the first");
                continue;
            }
            index.insert(tool.name.clone(), kept.len());
            kept.push(tool);
        }
        Self { tools: kept, index }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSchema> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether a call to `name` may run alongside other calls.
    ///
    /// Unknown tools are never batch-eligible.
    pub fn is_read_only(&self, name: &str) -> bool {
        self.get(name).is_some_and(ToolSchema::is_read_only)
    }

    /// Validate a tool call: the tool exists and every required field is present.
    ///
    /// This is a structural check only. Full JSON Schema validation is left
    /// to the backend.
    pub fn validate_tool_call(&self, request: &ToolCallRequest) -> Result<(), McpError> {
        let schema = self.get(request.name()).ok_or_else(|| McpError::UnknownTool {
            name: request.name().to_string(),
        })?;

        let missing: Vec<&str> = schema
            .required_fields()
            .into_iter()
            .filter(|field| !request.arguments().contains_key(*field))
            .collect();

        if !missing.is_empty() {
            return Err(McpError::InvalidArguments {
                tool: request.name().to_string(),
                reason: format!("missing required field(s): {}", missing.join(", ")),
            });
        }
        Ok(())
    }
}

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

struct CachedSet {
    generation: u64,
    tools: Arc<ToolSet>,
}

/// Generation-keyed cache of the backend's [`ToolSet`].
#[derive(Default)]
pub struct ToolCatalog {
    cached: Mutex<Option<CachedSet>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached set, if it was fetched from session `generation`.
    pub fn get(&self, generation: u64) -> Option<Arc<ToolSet>> {
        let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        cached
            .as_ref()
            .filter(|c| c.generation == generation)
            .map(|c| c.tools.clone())
    }

    /// Replace the cached set with tools fetched from session `generation`.
    pub fn store(&self, generation: u64, tools: Vec<ToolSchema>) -> Arc<ToolSet> {
        let set = Arc::new(ToolSet::new(tools));
        tracing::info!(generation, tools = set.len(), "tool catalog refreshed");
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(CachedSet {
            generation,
            tools: set.clone(),
        });
        set
    }

    /// Drop the cached set unconditionally.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
