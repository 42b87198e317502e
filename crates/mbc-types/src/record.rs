use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::InvokeContext;
use crate::error::TypeError;
use crate::keys::{self, EntityKey, VersionRef};

/// Business attributes of an entity. Ordered so that equality and
/// serialization are deterministic.
pub type Attributes = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// CommandInput
// ---------------------------------------------------------------------------

/// A proposed write.
///
/// `version` is the version the caller last observed: `0` for a brand-new
/// entity, otherwise the version of the record being replaced. The command
/// commits at `version + 1` or not at all.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInput {
    pub pk: String,
    pub sk: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub tenant_code: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub is_deleted: bool,
}

impl CommandInput {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>, version: u64) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            version,
            tenant_code: None,
            code: String::new(),
            name: String::new(),
            kind: String::new(),
            attributes: Attributes::new(),
            is_deleted: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_tenant(mut self, tenant_code: impl Into<String>) -> Self {
        self.tenant_code = Some(tenant_code.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.pk.clone(), self.sk.clone())
    }

    pub fn id(&self) -> String {
        keys::derive_id(&self.pk, &self.sk)
    }

    /// Explicit tenant code, falling back to the partition key segment.
    pub fn resolved_tenant(&self) -> Result<String, TypeError> {
        match self.tenant_code.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(t.to_string()),
            _ => keys::decode_tenant_code(&self.pk)
                .map(str::to_string)
                .ok_or_else(|| TypeError::MissingTenant {
                    pk: self.pk.clone(),
                }),
        }
    }

    /// Structural checks performed before any store access.
    pub fn validate(&self) -> Result<(), TypeError> {
        if self.pk.trim().is_empty() {
            return Err(TypeError::invalid_key(&self.pk, "partition key is empty"));
        }
        if !self.pk.contains(keys::KEY_SEPARATOR) {
            return Err(TypeError::invalid_key(
                &self.pk,
                "partition key must be {type}#{tenant}",
            ));
        }
        if self.sk.trim().is_empty() {
            return Err(TypeError::invalid_key(&self.sk, "sort key is empty"));
        }
        if let VersionRef::At(_) = keys::version_of(&self.sk) {
            return Err(TypeError::invalid_key(
                &self.sk,
                "sort key must not carry a version suffix",
            ));
        }
        self.resolved_tenant()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PartialUpdate
// ---------------------------------------------------------------------------

/// A merge-style write: unspecified fields keep their latest values and
/// `attributes` are shallow-merged into the latest attributes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialUpdate {
    pub pk: String,
    pub sk: String,
    /// Version observed by the caller; `None` applies to whatever is latest.
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub is_deleted: Option<bool>,
}

impl PartialUpdate {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            ..Default::default()
        }
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Merge onto the latest projection, producing a full command that
    /// expects the latest version.
    pub fn merge_onto(&self, latest: &DataRecord) -> CommandInput {
        let mut attributes = latest.attributes.clone();
        for (k, v) in &self.attributes {
            attributes.insert(k.clone(), v.clone());
        }
        CommandInput {
            pk: latest.pk.clone(),
            sk: latest.sk.clone(),
            version: latest.version,
            tenant_code: Some(latest.tenant_code.clone()),
            code: self.code.clone().unwrap_or_else(|| latest.code.clone()),
            name: self.name.clone().unwrap_or_else(|| latest.name.clone()),
            kind: latest.kind.clone(),
            attributes,
            is_deleted: self.is_deleted.unwrap_or(latest.is_deleted),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandRecord
// ---------------------------------------------------------------------------

/// A committed version in the command log. `sk` carries the version suffix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub pk: String,
    pub sk: String,
    pub id: String,
    pub tenant_code: String,
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u64,
    pub attributes: Attributes,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub created_ip: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_ip: String,
    pub source: String,
    pub request_id: String,
}

/// History rows have exactly the shape of command rows: one per
/// `(id, version)`, addressed by the version-suffixed sort key.
pub type HistoryRecord = CommandRecord;

impl CommandRecord {
    /// Build the record committed at `expected + 1`.
    ///
    /// Creation attribution is carried forward from `previous` so that it
    /// always reflects version 1.
    pub fn from_input(
        input: &CommandInput,
        tenant_code: String,
        ctx: &InvokeContext,
        previous: Option<&CommandRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        let version = input.version + 1;
        let (created_at, created_by, created_ip) = match previous {
            Some(p) => (p.created_at, p.created_by.clone(), p.created_ip.clone()),
            None => (now, ctx.user_id.clone(), ctx.ip.clone()),
        };
        Self {
            pk: input.pk.clone(),
            sk: keys::with_version(&input.sk, version),
            id: input.id(),
            tenant_code,
            code: input.code.clone(),
            name: input.name.clone(),
            kind: input.kind.clone(),
            version,
            attributes: input.attributes.clone(),
            is_deleted: input.is_deleted,
            created_at,
            created_by,
            created_ip,
            updated_at: now,
            updated_by: ctx.user_id.clone(),
            updated_ip: ctx.ip.clone(),
            source: ctx.source.clone(),
            request_id: ctx.request_id.clone(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.pk.clone(), self.sk.clone())
    }

    /// Sort key without the version suffix.
    pub fn base_sk(&self) -> &str {
        keys::strip_version(&self.sk)
    }

    /// Business-field equality, ignoring version and audit columns.
    pub fn same_content(&self, other: &CommandRecord) -> bool {
        self.code == other.code
            && self.name == other.name
            && self.kind == other.kind
            && self.attributes == other.attributes
            && self.is_deleted == other.is_deleted
    }

    pub fn to_data_record(&self) -> DataRecord {
        DataRecord::from(self)
    }
}

// ---------------------------------------------------------------------------
// DataRecord
// ---------------------------------------------------------------------------

/// Latest-version projection of an entity. `sk` carries no version suffix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRecord {
    pub pk: String,
    pub sk: String,
    pub id: String,
    pub tenant_code: String,
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u64,
    pub attributes: Attributes,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub created_ip: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_ip: String,
}

impl DataRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.pk.clone(), self.sk.clone())
    }
}

impl From<&CommandRecord> for DataRecord {
    fn from(cmd: &CommandRecord) -> Self {
        Self {
            pk: cmd.pk.clone(),
            sk: cmd.base_sk().to_string(),
            id: cmd.id.clone(),
            tenant_code: cmd.tenant_code.clone(),
            code: cmd.code.clone(),
            name: cmd.name.clone(),
            kind: cmd.kind.clone(),
            version: cmd.version,
            attributes: cmd.attributes.clone(),
            is_deleted: cmd.is_deleted,
            created_at: cmd.created_at,
            created_by: cmd.created_by.clone(),
            created_ip: cmd.created_ip.clone(),
            updated_at: cmd.updated_at,
            updated_by: cmd.updated_by.clone(),
            updated_ip: cmd.updated_ip.clone(),
        }
    }
}
