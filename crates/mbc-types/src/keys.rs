//! Composite key conventions shared by the command, data, and history tables.
//!
//! ```text
//! pk = {logicalType}#{tenantCode}          e.g. "PRODUCT#acme"
//! sk = {identifier}[@{version}]            e.g. "item#1@3"
//! id = {pk}#{identifier}                   e.g. "PRODUCT#acme#item#1"
//! ```
//!
//! Every function here is pure and total. Legacy rows with malformed keys
//! yield `None` or [`VersionRef::Latest`] instead of an error.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between key segments.
pub const KEY_SEPARATOR: char = '#';

/// Separator between a sort key and its version suffix.
pub const VERSION_SEPARATOR: char = '@';

/// Tenant code for data shared across every tenant.
pub const COMMON_TENANT: &str = "common";

/// Expected version presented when creating a brand-new entity.
pub const VERSION_FIRST: u64 = 0;

/// Which version a sort key addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionRef {
    /// No (parsable) version suffix: the current-value slot.
    Latest,
    /// An explicit committed version.
    At(u64),
}

impl VersionRef {
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Latest => None,
            Self::At(v) => Some(*v),
        }
    }
}

pub fn encode_partition_key(prefix: &str, tenant_code: &str) -> String {
    format!("{prefix}{KEY_SEPARATOR}{tenant_code}")
}

pub fn encode_sort_key(identifier: &str, version: Option<u64>) -> String {
    match version {
        Some(v) => with_version(identifier, v),
        None => identifier.to_string(),
    }
}

/// Extract the tenant segment of a partition key.
///
/// Returns `None` when the key has no separator or an empty tenant segment.
pub fn decode_tenant_code(pk: &str) -> Option<&str> {
    let (_, rest) = pk.split_once(KEY_SEPARATOR)?;
    let tenant = rest.split(KEY_SEPARATOR).next()?;
    (!tenant.is_empty()).then_some(tenant)
}

pub fn is_common_tenant(tenant_code: &str) -> bool {
    tenant_code.eq_ignore_ascii_case(COMMON_TENANT)
}

/// Remove a numeric version suffix, if any.
///
/// A trailing `@` segment that does not parse as a version is left in place:
/// identifiers such as e-mail addresses may contain the separator.
pub fn strip_version(sk: &str) -> &str {
    match sk.rsplit_once(VERSION_SEPARATOR) {
        Some((base, suffix)) if parse_version(suffix).is_some() => base,
        _ => sk,
    }
}

/// Replace (or add) the version suffix of a sort key.
pub fn with_version(sk: &str, version: u64) -> String {
    format!("{}{VERSION_SEPARATOR}{version}", strip_version(sk))
}

pub fn version_of(sk: &str) -> VersionRef {
    sk.rsplit_once(VERSION_SEPARATOR)
        .and_then(|(_, suffix)| parse_version(suffix))
        .map_or(VersionRef::Latest, VersionRef::At)
}

/// Identity of an entity across its whole version history.
pub fn derive_id(pk: &str, sk: &str) -> String {
    format!("{pk}{KEY_SEPARATOR}{}", strip_version(sk))
}

fn parse_version(suffix: &str) -> Option<u64> {
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// A `(pk, sk)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub pk: String,
    pub sk: String,
}

impl EntityKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    pub fn id(&self) -> String {
        derive_id(&self.pk, &self.sk)
    }

    pub fn tenant_code(&self) -> Option<&str> {
        decode_tenant_code(&self.pk)
    }

    pub fn version(&self) -> VersionRef {
        version_of(&self.sk)
    }

    /// The same entity at an explicit version.
    pub fn versioned(&self, version: u64) -> Self {
        Self {
            pk: self.pk.clone(),
            sk: with_version(&self.sk, version),
        }
    }

    /// The same entity's current-value slot.
    pub fn latest(&self) -> Self {
        Self {
            pk: self.pk.clone(),
            sk: strip_version(&self.sk).to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.pk, self.sk)
    }
}
