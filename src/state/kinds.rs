use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RegistryError;

/// Declares a closed, string-backed enum that round-trips through SQLite,
/// serde and `FromStr` using the same text form.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = RegistryError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                $(
                    if s.eq_ignore_ascii_case($text) {
                        return Ok($name::$variant);
                    }
                )+
                Err(RegistryError::Validation(format!(
                    "unknown {} '{}' (expected one of: {})",
                    stringify!($name),
                    s,
                    [$($text),+].join(", ")
                )))
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: RegistryError| FromSqlError::Other(Box::new(e)))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

string_enum! {
    /// Pipeline stage. Each stage owns one folder inside an environment.
    Stage {
        DataInputs => "data_inputs",
        Models => "models",
        Results => "results",
        Reports => "reports",
    }
}

impl Stage {
    /// Folder name inside an environment's asset tree.
    pub fn folder(&self) -> &'static str {
        self.as_str()
    }

    pub fn target_kind(&self) -> TargetKind {
        match self {
            Stage::DataInputs => TargetKind::DataInputFile,
            Stage::Models => TargetKind::ModelFile,
            Stage::Results => TargetKind::ResultFile,
            Stage::Reports => TargetKind::ReportFile,
        }
    }
}

// ─── Roles ──────────────────────────────────────────────────────────────────

string_enum! {
    Role {
        Admin => "admin",
        Developer => "developer",
        Exec => "exec",
        Risk => "risk",
        Commercial => "commercial",
        InputsAdmin => "inputs_admin",
    }
}

/// A set of roles, or every role.
///
/// Stored as `all` or a comma-separated list; parsing rejects unknown roles
/// and empty lists so nothing malformed ever reaches the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleSet {
    All,
    Only(BTreeSet<Role>),
}

impl RoleSet {
    pub fn only(roles: impl IntoIterator<Item = Role>) -> Self {
        RoleSet::Only(roles.into_iter().collect())
    }

    pub fn allows(&self, role: Role) -> bool {
        match self {
            RoleSet::All => true,
            RoleSet::Only(roles) => roles.contains(&role),
        }
    }
}

impl Default for RoleSet {
    fn default() -> Self {
        RoleSet::only([Role::Admin])
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleSet::All => f.write_str("all"),
            RoleSet::Only(roles) => {
                let names: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}

impl FromStr for RoleSet {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(RegistryError::validation("role set cannot be empty"));
        }
        if parts.iter().any(|p| p.eq_ignore_ascii_case("all")) {
            return Ok(RoleSet::All);
        }
        let roles = parts
            .into_iter()
            .map(Role::from_str)
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(RoleSet::Only(roles))
    }
}

impl ToSql for RoleSet {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for RoleSet {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: RegistryError| FromSqlError::Other(Box::new(e)))
    }
}

impl Serialize for RoleSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RoleSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Environments ───────────────────────────────────────────────────────────

string_enum! {
    Category {
        Production => "Production",
        Reporting => "Reporting",
        Validation => "Validation",
        Testing => "Testing",
        Development => "Development",
    }
}

string_enum! {
    EnvStatus {
        Active => "Active",
        Locked => "Locked",
        Archived => "Archived",
        Pending => "Pending",
        Rejected => "Rejected",
    }
}

// ─── Blueprints ─────────────────────────────────────────────────────────────

string_enum! {
    BlueprintStatus {
        Active => "Active",
        Archived => "Archived",
    }
}

string_enum! {
    Workflow {
        DoerOnly => "doer_only",
        DoerAndReviewer => "doer_and_reviewer",
    }
}

string_enum! {
    /// Where a blueprint's files come from.
    SourceType {
        Internal => "internal",
        ExternalThirdParty => "external_third_party",
        ExternalConnection => "external_connection",
    }
}

// ─── File instances ─────────────────────────────────────────────────────────

string_enum! {
    InstanceStatus {
        Active => "Active",
        Superseded => "Superseded",
        Rejected => "Rejected",
    }
}

// ─── Audit ──────────────────────────────────────────────────────────────────

string_enum! {
    /// The hat an actor wears when an audit entry is written.
    Capacity {
        Doer => "Doer",
        Reviewer => "Reviewer",
        Owner => "Owner",
        Admin => "Admin",
        System => "System",
        User => "User",
    }
}

impl Capacity {
    /// Capacities that count as the second, approving signature.
    pub fn is_reviewer_equivalent(&self) -> bool {
        matches!(self, Capacity::Reviewer | Capacity::Owner)
    }
}

string_enum! {
    AuditAction {
        Create => "CREATE",
        SignOff => "SIGN_OFF",
        Reject => "REJECT",
        Revoke => "REVOKE",
        Update => "UPDATE",
        UpdateStatus => "UPDATE_STATUS",
        Close => "CLOSE",
        Delete => "DELETE",
        Clone => "CLONE",
        CloneFile => "CLONE_FILE",
        ClonePlan => "CLONE_PLAN",
        PruneFiles => "PRUNE_FILES",
        AddDependency => "ADD_DEPENDENCY",
        RemoveDependency => "REMOVE_DEPENDENCY",
    }
}

string_enum! {
    /// Human governance decision against a file instance.
    SignOffAction {
        SignOff => "sign_off",
        Reject => "reject",
        Revoke => "revoke",
    }
}

impl SignOffAction {
    pub fn audit_action(&self) -> AuditAction {
        match self {
            SignOffAction::SignOff => AuditAction::SignOff,
            SignOffAction::Reject => AuditAction::Reject,
            SignOffAction::Revoke => AuditAction::Revoke,
        }
    }
}

// ─── Cloning ────────────────────────────────────────────────────────────────

string_enum! {
    /// Which file instances an environment clone carries over.
    VersioningProfile {
        LatestApproved => "latest_approved",
        FullHistoryNoSuperseded => "full_history_no_superseded",
        CarbonCopyForensic => "carbon_copy_forensic",
    }
}

// ─── Planning ───────────────────────────────────────────────────────────────

string_enum! {
    MilestoneStatus {
        Pending => "Pending",
        Complete => "Complete",
    }
}

string_enum! {
    ActionStatus {
        Open => "Open",
        Closed => "Closed",
    }
}

// ─── Polymorphic targets ────────────────────────────────────────────────────

string_enum! {
    /// Discriminator stored next to a target id in audit and planning rows.
    TargetKind {
        DataInputFile => "data_input_files",
        ModelFile => "model_files",
        ResultFile => "result_files",
        ReportFile => "report_files",
        Environment => "environments",
        Blueprint => "blueprints",
        Milestone => "milestones",
        ActionItem => "action_items",
    }
}

impl TargetKind {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            TargetKind::DataInputFile => Some(Stage::DataInputs),
            TargetKind::ModelFile => Some(Stage::Models),
            TargetKind::ResultFile => Some(Stage::Results),
            TargetKind::ReportFile => Some(Stage::Reports),
            _ => None,
        }
    }
}

/// Address of one file instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRef {
    pub stage: Stage,
    pub id: i64,
}

impl FileRef {
    pub fn new(stage: Stage, id: i64) -> Self {
        Self { stage, id }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage, self.id)
    }
}

impl FromStr for FileRef {
    type Err = RegistryError;

    /// Parses `stage:id`, e.g. `data_inputs:12`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stage, id) = s
            .split_once(':')
            .ok_or_else(|| RegistryError::validation(format!("expected stage:id, got '{}'", s)))?;
        let id = id
            .trim()
            .parse::<i64>()
            .map_err(|_| RegistryError::validation(format!("invalid file id in '{}'", s)))?;
        Ok(FileRef::new(stage.parse()?, id))
    }
}

/// Anything an audit entry, action item or milestone can point at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    File(FileRef),
    Environment(String),
    Blueprint(String),
    Milestone(i64),
    ActionItem(i64),
}

impl Target {
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::File(file) => file.stage.target_kind(),
            Target::Environment(_) => TargetKind::Environment,
            Target::Blueprint(_) => TargetKind::Blueprint,
            Target::Milestone(_) => TargetKind::Milestone,
            Target::ActionItem(_) => TargetKind::ActionItem,
        }
    }

    /// The id column value as stored.
    pub fn id_text(&self) -> String {
        match self {
            Target::File(file) => file.id.to_string(),
            Target::Environment(id) | Target::Blueprint(id) => id.clone(),
            Target::Milestone(id) | Target::ActionItem(id) => id.to_string(),
        }
    }

    pub fn from_parts(kind: TargetKind, id: &str) -> Result<Self, RegistryError> {
        let numeric = || {
            id.parse::<i64>().map_err(|_| {
                RegistryError::validation(format!("target {} has non-numeric id '{}'", kind, id))
            })
        };
        Ok(match kind {
            TargetKind::Environment => Target::Environment(id.to_string()),
            TargetKind::Blueprint => Target::Blueprint(id.to_string()),
            TargetKind::Milestone => Target::Milestone(numeric()?),
            TargetKind::ActionItem => Target::ActionItem(numeric()?),
            file_kind => match file_kind.stage() {
                Some(stage) => Target::File(FileRef::new(stage, numeric()?)),
                None => unreachable!("non-file target kinds are matched above"),
            },
        })
    }

    pub fn as_file(&self) -> Option<FileRef> {
        match self {
            Target::File(file) => Some(*file),
            _ => None,
        }
    }
}

impl From<FileRef> for Target {
    fn from(file: FileRef) -> Self {
        Target::File(file)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id_text())
    }
}

impl FromStr for Target {
    type Err = RegistryError;

    /// Parses `kind:id`. File targets also accept the stage name as kind.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| RegistryError::validation(format!("expected kind:id, got '{}'", s)))?;
        if let Ok(stage) = kind.parse::<Stage>() {
            return Target::from_parts(stage.target_kind(), id.trim());
        }
        Target::from_parts(kind.parse()?, id.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_set_parses_and_normalizes() {
        let set: RoleSet = "risk, admin".parse().unwrap();
        assert!(set.allows(Role::Admin));
        assert!(set.allows(Role::Risk));
        assert!(!set.allows(Role::Exec));
        assert_eq!(set.to_string(), "admin,risk");

        let all: RoleSet = "admin,all".parse().unwrap();
        assert_eq!(all, RoleSet::All);
    }

    #[test]
    fn role_set_rejects_unknown_and_empty() {
        assert!("wizard".parse::<RoleSet>().is_err());
        assert!(" , ".parse::<RoleSet>().is_err());
    }

    #[test]
    fn target_text_form() {
        let t: Target = "models:7".parse().unwrap();
        assert_eq!(t, Target::File(FileRef::new(Stage::Models, 7)));
        assert_eq!(t.to_string(), "model_files:7");

        let again: Target = t.to_string().parse().unwrap();
        assert_eq!(again, t);

        let env: Target = "environments:q4_prod".parse().unwrap();
        assert_eq!(env, Target::Environment("q4_prod".to_string()));

        assert!("milestones:abc".parse::<Target>().is_err());
        assert!("nonsense".parse::<Target>().is_err());
    }
}
