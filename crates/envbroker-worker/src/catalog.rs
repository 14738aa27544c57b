// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Add-on catalog.
//!
//! Each add-on is a service offered by the add-on broker. An add-on with an
//! empty `plans` list is installed for every environment; otherwise only
//! for the listed broker plans.

use serde::{Deserialize, Serialize};

/// One service-broker add-on installed into new environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOn {
    /// Name used in the operation payload and step names.
    pub name: String,
    /// Broker service ID.
    pub service_id: String,
    /// Broker plan ID of the service.
    pub plan_id: String,
    /// Environment plans that get this add-on. Empty means all.
    #[serde(default)]
    pub plans: Vec<String>,
}

impl AddOn {
    pub fn new(
        name: impl Into<String>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_id: service_id.into(),
            plan_id: plan_id.into(),
            plans: Vec::new(),
        }
    }

    /// Restrict the add-on to the given environment plans.
    pub fn for_plans<I, S>(mut self, plans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plans = plans.into_iter().map(Into::into).collect();
        self
    }

    /// Whether an environment on `plan` gets this add-on.
    pub fn applies_to_plan(&self, plan: Option<&str>) -> bool {
        if self.plans.is_empty() {
            return true;
        }
        plan.is_some_and(|plan| self.plans.iter().any(|p| p == plan))
    }
}

/// Add-ons installed when no catalog is configured.
pub fn default_catalog() -> Vec<AddOn> {
    vec![
        AddOn::new("logging", "logging-service", "logging-default"),
        AddOn::new("connectivity", "connectivity-service", "connectivity-default")
            .for_plans(["aws", "azure", "gcp"]),
        AddOn::new("eventing", "eventing-service", "eventing-default"),
    ]
}
