//! Sender number resolution per tenant.

use std::collections::HashMap;

use tracing::warn;

use crate::types::OrgId;

/// Resolves the default outbound number for a tenant.
pub trait NumberResolver: Send + Sync {
    fn default_from_number(&self, org_id: OrgId) -> Option<String>;
}

/// Numbers from configuration, with an optional fallback for unknown tenants.
#[derive(Debug, Clone, Default)]
pub struct StaticNumberResolver {
    by_org: HashMap<OrgId, String>,
    fallback: Option<String>,
}

impl StaticNumberResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_number(mut self, org_id: OrgId, number: impl Into<String>) -> Self {
        self.by_org.insert(org_id, number.into());
        self
    }

    pub fn with_fallback(mut self, number: impl Into<String>) -> Self {
        let number = number.into();
        self.fallback = (!number.trim().is_empty()).then_some(number);
        self
    }

    /// Parses `org=+1555...,org2=+1555...`. A bare `*=+1555...` entry sets
    /// the fallback. Malformed entries are skipped with a warning.
    pub fn parse(raw: &str) -> Self {
        let mut resolver = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((org, number)) = entry.split_once('=') else {
                warn!(entry = %entry, "Ignoring from-number entry without '='");
                continue;
            };
            let (org, number) = (org.trim(), number.trim());
            if org == "*" {
                resolver = resolver.with_fallback(number);
                continue;
            }
            match OrgId::parse(org) {
                Ok(org_id) if !number.is_empty() => resolver = resolver.with_number(org_id, number),
                Ok(_) => warn!(org = %org, "Ignoring empty from-number"),
                Err(e) => warn!(error = %e, "Ignoring from-number entry"),
            }
        }
        resolver
    }

    pub fn len(&self) -> usize {
        self.by_org.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_org.is_empty() && self.fallback.is_none()
    }
}

impl NumberResolver for StaticNumberResolver {
    fn default_from_number(&self, org_id: OrgId) -> Option<String> {
        self.by_org
            .get(&org_id)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}
