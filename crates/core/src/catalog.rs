//! Service catalog and plan resolution.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Resolves service/plan ids against the broker's catalog.
pub trait CatalogValidator: Send + Sync + 'static {
    /// `None` when the service or the plan within it is unknown.
    fn resolve(&self, service_id: &str, plan_id: &str) -> Option<PlanDescriptor>;
}

/// The catalog facts the engine needs about a resolved plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDescriptor {
    pub service_id: String,
    pub plan_id: String,
    pub plan_name: String,
    /// Provisioning this plan never completes synchronously.
    pub requires_async: bool,
    /// The offering hands out bindings.
    pub bindable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub services: Vec<ServiceOffering>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_bindable")]
    pub bindable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub plans: Vec<ServicePlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Broker-side setting; not part of the published catalog.
    #[serde(default, skip_serializing)]
    pub requires_async: bool,
}

fn default_bindable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog contains no services")]
    Empty,
    #[error("service or plan with an empty id")]
    EmptyId,
    #[error("duplicate service id '{0}'")]
    DuplicateService(String),
    #[error("service '{0}' has no plans")]
    NoPlans(String),
    #[error("duplicate plan id '{plan_id}' in service '{service_id}'")]
    DuplicatePlan { service_id: String, plan_id: String },
}

/// A catalog fixed at startup.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    catalog: Catalog,
}

impl StaticCatalog {
    pub fn new(catalog: Catalog) -> Result<Self, CatalogError> {
        if catalog.services.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut service_ids = HashSet::new();
        for service in &catalog.services {
            if service.id.is_empty() {
                return Err(CatalogError::EmptyId);
            }
            if !service_ids.insert(service.id.as_str()) {
                return Err(CatalogError::DuplicateService(service.id.clone()));
            }
            if service.plans.is_empty() {
                return Err(CatalogError::NoPlans(service.id.clone()));
            }
            let mut plan_ids = HashSet::new();
            for plan in &service.plans {
                if plan.id.is_empty() {
                    return Err(CatalogError::EmptyId);
                }
                if !plan_ids.insert(plan.id.as_str()) {
                    return Err(CatalogError::DuplicatePlan {
                        service_id: service.id.clone(),
                        plan_id: plan.id.clone(),
                    });
                }
            }
        }
        Ok(Self { catalog })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

impl CatalogValidator for StaticCatalog {
    fn resolve(&self, service_id: &str, plan_id: &str) -> Option<PlanDescriptor> {
        let service = self.catalog.services.iter().find(|s| s.id == service_id)?;
        let plan = service.plans.iter().find(|p| p.id == plan_id)?;
        Some(PlanDescriptor {
            service_id: service.id.clone(),
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            requires_async: plan.requires_async,
            bindable: service.bindable,
        })
    }
}
