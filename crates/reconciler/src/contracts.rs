//! Service contracts: what a service needs from the device it runs on.
//!
//! A contract lists requirements such as `{"type": "sw.l4t", "version": ">=32.2"}`.
//! Requirements are checked against [`DeviceCapabilities`]; a service whose
//! requirements are not all satisfied cannot run here. Optional services
//! with unmet contracts are dropped from the target, any other unmet
//! service rejects its whole app.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{AppId, ComposeApp};

/// One requirement of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRequirement {
    #[serde(rename = "type")]
    pub kind: String,
    /// Version constraint, e.g. `>=1.2`. No constraint means presence is enough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A service contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceContract {
    #[serde(default)]
    pub requires: Vec<ContractRequirement>,
}

/// Capabilities the device offers, keyed by type with their version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceCapabilities {
    versions: BTreeMap<String, String>,
}

impl DeviceCapabilities {
    /// No capabilities.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability.
    pub fn with(mut self, kind: impl Into<String>, version: impl Into<String>) -> Self {
        self.versions.insert(kind.into(), version.into());
        self
    }

    /// Whether the device meets `requirement`.
    pub fn satisfies(&self, requirement: &ContractRequirement) -> bool {
        let Some(available) = self.versions.get(&requirement.kind) else {
            return false;
        };
        match requirement.version.as_deref() {
            None => true,
            Some(constraint) => match Constraint::parse(constraint) {
                Some(constraint) => constraint.accepts(available),
                None => {
                    debug!(kind = %requirement.kind, constraint, "Unparseable version constraint");
                    false
                }
            },
        }
    }

    /// Whether the device meets every requirement of `contract`.
    pub fn fulfils(&self, contract: &ServiceContract) -> bool {
        contract.requires.iter().all(|r| self.satisfies(r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Constraint {
    comparator: Comparator,
    version: Vec<u64>,
}

impl Constraint {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (comparator, rest) = [
            (">=", Comparator::Ge),
            ("<=", Comparator::Le),
            (">", Comparator::Gt),
            ("<", Comparator::Lt),
            ("=", Comparator::Eq),
        ]
        .into_iter()
        .find_map(|(prefix, comparator)| raw.strip_prefix(prefix).map(|rest| (comparator, rest)))
        .unwrap_or((Comparator::Eq, raw));

        parse_version(rest.trim()).map(|version| Self { comparator, version })
    }

    fn accepts(&self, available: &str) -> bool {
        let Some(available) = parse_version(available) else {
            return false;
        };
        let ordering = compare_versions(&available, &self.version);
        match self.comparator {
            Comparator::Eq => ordering == Ordering::Equal,
            Comparator::Ge => ordering != Ordering::Less,
            Comparator::Gt => ordering == Ordering::Greater,
            Comparator::Le => ordering != Ordering::Greater,
            Comparator::Lt => ordering == Ordering::Less,
        }
    }
}

/// Numeric dotted version; a leading `v` and any `-suffix` are ignored.
fn parse_version(raw: &str) -> Option<Vec<u64>> {
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    let core = raw.split(['-', '+']).next().unwrap_or(raw);
    if core.is_empty() {
        return None;
    }
    core.split('.').map(|part| part.parse().ok()).collect()
}

/// Missing components count as zero, so `1.2` equals `1.2.0`.
fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|ordering| *ordering != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Outcome of checking one app's services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractCheck {
    /// No required service is unmet.
    pub valid: bool,
    /// Services that may run.
    pub fulfilled: Vec<String>,
    /// Required services whose contract is unmet.
    pub unmet: Vec<String>,
    /// Optional services whose contract is unmet.
    pub unmet_optional: Vec<String>,
}

/// Check every service of `app`. Services without a contract always pass.
pub fn check_app(app: &ComposeApp, capabilities: &DeviceCapabilities) -> ContractCheck {
    let mut check = ContractCheck::default();
    for service in &app.services {
        let met = service
            .contract
            .as_ref()
            .is_none_or(|contract| capabilities.fulfils(contract));
        let name = service.service_name.clone();
        match (met, service.is_optional()) {
            (true, _) => check.fulfilled.push(name),
            (false, true) => check.unmet_optional.push(name),
            (false, false) => check.unmet.push(name),
        }
    }
    check.valid = check.unmet.is_empty();
    check
}

/// Check all apps of a target.
pub fn validate_target_contracts(
    apps: &BTreeMap<AppId, ComposeApp>,
    capabilities: &DeviceCapabilities,
) -> BTreeMap<AppId, ContractCheck> {
    apps.iter()
        .map(|(app_id, app)| (*app_id, check_app(app, capabilities)))
        .collect()
}
