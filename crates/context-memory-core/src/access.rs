//! Role-based access control and audit logging.
//!
//! Permissions form a closed set ([`Permission`]); every engine operation
//! maps to an [`Action`], and [`Action::required_permission`] is the single
//! policy function that decides which permission a role must hold. Roles
//! are a typed `role -> permission set` table; users map to exactly one
//! role.
//!
//! Every decision made through [`AccessGuard::authorize`] lands in the
//! [`AuditLog`], allowed or not.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Name recorded for calls made without a user.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Delete,
    /// Implies every other permission.
    Admin,
}

impl FromStr for Permission {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            "admin" => Ok(Self::Admin),
            other => Err(EngineError::validation(format!("unknown permission '{other}'"))),
        }
    }
}

/// An operation subject to access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Delete,
    ManageRoles,
}

impl Action {
    pub fn required_permission(self) -> Permission {
        match self {
            Action::Read => Permission::Read,
            Action::Write => Permission::Write,
            Action::Delete => Permission::Delete,
            Action::ManageRoles => Permission::Admin,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
            Action::ManageRoles => "manage roles",
        })
    }
}

/// The `[security]` config section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// When false every check allows (decisions are still audited).
    pub enabled: bool,
    pub sanitize_inputs: bool,
    /// Role used for calls that carry no user. `None` denies them.
    pub anonymous_role: Option<String>,
    /// role name -> permission names
    pub roles: BTreeMap<String, Vec<String>>,
    /// user -> role name
    pub users: BTreeMap<String, String>,
    pub max_input_chars: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        let roles = [
            ("admin", vec!["admin"]),
            ("editor", vec!["read", "write", "delete"]),
            ("reader", vec!["read"]),
        ]
        .into_iter()
        .map(|(role, perms)| (role.to_string(), perms.into_iter().map(String::from).collect()))
        .collect();
        Self {
            enabled: true,
            sanitize_inputs: true,
            anonymous_role: Some("editor".to_string()),
            roles,
            users: BTreeMap::new(),
            max_input_chars: 4096,
        }
    }
}

impl SecurityConfig {
    /// Parse the role table, rejecting unknown permissions and dangling
    /// role references.
    pub fn role_table(&self) -> Result<BTreeMap<String, BTreeSet<Permission>>> {
        let mut table = BTreeMap::new();
        for (role, names) in &self.roles {
            let perms = names
                .iter()
                .map(|n| n.parse::<Permission>())
                .collect::<Result<BTreeSet<_>>>()
                .map_err(|e| EngineError::validation(format!("security.roles.{role}: {e}")))?;
            table.insert(role.clone(), perms);
        }
        for (user, role) in &self.users {
            if !table.contains_key(role) {
                return Err(EngineError::validation(format!(
                    "security.users.{user} refers to undefined role '{role}'"
                )));
            }
        }
        if let Some(role) = &self.anonymous_role {
            if !table.contains_key(role) {
                return Err(EngineError::validation(format!(
                    "security.anonymous_role refers to undefined role '{role}'"
                )));
            }
        }
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_input_chars == 0 {
            return Err(EngineError::validation("security.max_input_chars must be > 0"));
        }
        self.role_table().map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    /// Allowed, but the operation itself failed.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub action: Action,
    pub target: String,
    pub outcome: AuditOutcome,
}

/// Bounded in-memory audit trail. The oldest entries are dropped first.
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl AuditLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, user: Option<&str>, action: Action, target: &str, outcome: AuditOutcome) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            user: user.unwrap_or(ANONYMOUS).to_string(),
            action,
            target: target.to_string(),
            outcome,
        };
        if outcome == AuditOutcome::Denied {
            tracing::warn!(user = %entry.user, action = %action, target, "access denied");
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn entries_by_outcome(&self, outcome: AuditOutcome) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.outcome == outcome)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Policy {
    roles: BTreeMap<String, BTreeSet<Permission>>,
    users: HashMap<String, String>,
}

/// Access control guard shared by every engine operation.
pub struct AccessGuard {
    enabled: bool,
    anonymous_role: Option<String>,
    policy: RwLock<Policy>,
    audit: AuditLog,
}

impl AccessGuard {
    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        let roles = config.role_table()?;
        Ok(Self {
            enabled: config.enabled,
            anonymous_role: config.anonymous_role.clone(),
            policy: RwLock::new(Policy {
                roles,
                users: config.users.iter().map(|(u, r)| (u.clone(), r.clone())).collect(),
            }),
            audit: AuditLog::default(),
        })
    }

    /// Pure policy check. Unknown users and missing permissions deny.
    pub fn check(&self, user: Option<&str>, action: Action) -> Decision {
        if !self.enabled {
            return Decision::Allow;
        }
        let policy = self.policy.read();
        let role = match user {
            Some(u) => policy.users.get(u),
            None => self.anonymous_role.as_ref(),
        };
        let Some(perms) = role.and_then(|r| policy.roles.get(r)) else {
            return Decision::Deny;
        };
        let needed = action.required_permission();
        if perms.contains(&Permission::Admin) || perms.contains(&needed) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// [`check`](Self::check) and record the decision in the audit log.
    pub fn authorize(&self, user: Option<&str>, action: Action, target: &str) -> Decision {
        let decision = self.check(user, action);
        let outcome = match decision {
            Decision::Allow => AuditOutcome::Allowed,
            Decision::Deny => AuditOutcome::Denied,
        };
        self.audit.record(user, action, target, outcome);
        decision
    }

    /// Like [`authorize`](Self::authorize) but turns a denial into
    /// [`EngineError::Forbidden`].
    pub fn require(&self, user: Option<&str>, action: Action, target: &str) -> Result<()> {
        match self.authorize(user, action, target) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(EngineError::Forbidden {
                user: user.unwrap_or(ANONYMOUS).to_string(),
                action,
            }),
        }
    }

    /// Create or replace a role.
    pub fn define_role(&self, actor: Option<&str>, role: &str, permissions: &[Permission]) -> Result<()> {
        self.require(actor, Action::ManageRoles, &format!("role:{role}"))?;
        if role.trim().is_empty() {
            return Err(EngineError::validation("role name must not be empty"));
        }
        self.policy
            .write()
            .roles
            .insert(role.to_string(), permissions.iter().copied().collect());
        tracing::info!(role, ?permissions, "role defined");
        Ok(())
    }

    pub fn assign_role(&self, actor: Option<&str>, user: &str, role: &str) -> Result<()> {
        self.require(actor, Action::ManageRoles, &format!("user:{user}"))?;
        let mut policy = self.policy.write();
        if !policy.roles.contains_key(role) {
            return Err(EngineError::validation(format!("undefined role '{role}'")));
        }
        policy.users.insert(user.to_string(), role.to_string());
        tracing::info!(user, role, "role assigned");
        Ok(())
    }

    /// Remove a user's role. Returns whether the user had one.
    pub fn revoke_user(&self, actor: Option<&str>, user: &str) -> Result<bool> {
        self.require(actor, Action::ManageRoles, &format!("user:{user}"))?;
        Ok(self.policy.write().users.remove(user).is_some())
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}

/// Strip control characters (newline and tab are kept as whitespace),
/// collapse whitespace runs to single spaces, trim, and cap at
/// `max_chars` characters.
pub fn sanitize_input(text: &str, max_chars: usize) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect()
}
