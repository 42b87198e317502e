use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use mbc_command::{CommandError, CommandService, PublishMode};
use mbc_types::{encode_partition_key, Attributes, CommandInput, CommandRecord, DataRecord, InvokeContext};

use crate::error::ImportResult;
use crate::job::ValidationFailure;

/// First phase of a row: shape raw input into a typed DTO and check it.
pub trait ImportStrategy: Send + Sync + 'static {
    type Dto: Send + Sync + 'static;

    fn transform(&self, raw: &Attributes, tenant_code: &str) -> Result<Self::Dto, Vec<ValidationFailure>>;

    fn validate(&self, dto: &Self::Dto) -> Result<(), Vec<ValidationFailure>>;
}

/// How an incoming DTO relates to what is already stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonStatus {
    NotExist,
    Changed,
    Equal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub status: ComparisonStatus,
    pub existing: Option<DataRecord>,
}

impl Comparison {
    pub fn not_exist() -> Self {
        Self {
            status: ComparisonStatus::NotExist,
            existing: None,
        }
    }

    pub fn changed(existing: DataRecord) -> Self {
        Self {
            status: ComparisonStatus::Changed,
            existing: Some(existing),
        }
    }

    pub fn equal(existing: DataRecord) -> Self {
        Self {
            status: ComparisonStatus::Equal,
            existing: Some(existing),
        }
    }
}

/// Second phase of a row: decide what to write and write it.
#[async_trait]
pub trait ProcessStrategy: Send + Sync + 'static {
    type Dto: Send + Sync + 'static;

    async fn compare(&self, dto: &Self::Dto, tenant_code: &str) -> ImportResult<Comparison>;

    /// Build the command for a `NotExist` or `Changed` row. `None` skips the
    /// row.
    fn map(
        &self,
        status: ComparisonStatus,
        dto: &Self::Dto,
        tenant_code: &str,
        existing: Option<&DataRecord>,
    ) -> Option<CommandInput>;

    fn command_service(&self) -> Arc<CommandService>;
}

/// Terminal result of running one row through a pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum RowOutcome {
    Published(Box<CommandRecord>),
    /// `Equal` comparison or a mapping that chose to skip.
    Unchanged,
    Invalid(Vec<ValidationFailure>),
    Failed(String),
}

impl RowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Published(_) | Self::Unchanged)
    }

    pub fn to_result(&self) -> Option<Value> {
        match self {
            Self::Published(record) => Some(serde_json::json!({
                "status": "published",
                "id": record.id,
                "version": record.version,
            })),
            Self::Unchanged => Some(serde_json::json!({ "status": "unchanged" })),
            Self::Invalid(_) | Self::Failed(_) => None,
        }
    }
}

/// Type-erased import + process pair for one table.
#[async_trait]
pub trait RowPipeline: Send + Sync {
    async fn run(
        &self,
        raw: &Attributes,
        tenant_code: &str,
        ctx: &InvokeContext,
        conflict_retries: u32,
    ) -> RowOutcome;
}

/// Binds an [`ImportStrategy`] and a [`ProcessStrategy`] that agree on the
/// DTO type.
pub struct TablePipeline<I, P> {
    import: I,
    process: P,
}

impl<I, P> TablePipeline<I, P>
where
    I: ImportStrategy,
    P: ProcessStrategy<Dto = I::Dto>,
{
    pub fn new(import: I, process: P) -> Self {
        Self { import, process }
    }
}

#[async_trait]
impl<I, P> RowPipeline for TablePipeline<I, P>
where
    I: ImportStrategy,
    P: ProcessStrategy<Dto = I::Dto>,
{
    async fn run(
        &self,
        raw: &Attributes,
        tenant_code: &str,
        ctx: &InvokeContext,
        conflict_retries: u32,
    ) -> RowOutcome {
        let dto = match self.import.transform(raw, tenant_code) {
            Ok(dto) => dto,
            Err(failures) => return RowOutcome::Invalid(failures),
        };
        if let Err(failures) = self.import.validate(&dto) {
            return RowOutcome::Invalid(failures);
        }

        let service = self.process.command_service();
        let mut attempt = 0;
        loop {
            let comparison = match self.process.compare(&dto, tenant_code).await {
                Ok(c) => c,
                Err(e) => return RowOutcome::Failed(e.to_string()),
            };
            if comparison.status == ComparisonStatus::Equal {
                return RowOutcome::Unchanged;
            }
            let Some(input) = self.process.map(
                comparison.status,
                &dto,
                tenant_code,
                comparison.existing.as_ref(),
            ) else {
                return RowOutcome::Unchanged;
            };

            match service.publish(input, ctx, PublishMode::Async).await {
                Ok(record) => return RowOutcome::Published(Box::new(record)),
                Err(e @ CommandError::VersionConflict { .. }) if attempt < conflict_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "row hit a version conflict, re-comparing");
                }
                Err(e) => return RowOutcome::Failed(e.to_string()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Attribute table strategy
// ---------------------------------------------------------------------------

/// A row of a generic attribute table.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeRow {
    pub pk: String,
    pub sk: String,
    pub code: String,
    pub name: String,
    pub attributes: Attributes,
}

/// Generic strategy for tables whose rows map one-to-one onto entities:
/// `pk = {kind}#{tenant}`, `sk = code`, every other column becomes an
/// attribute.
pub struct AttributeTableStrategy {
    kind: String,
    required: Vec<String>,
    service: Arc<CommandService>,
}

impl AttributeTableStrategy {
    pub fn new(kind: impl Into<String>, service: Arc<CommandService>) -> Self {
        Self {
            kind: kind.into(),
            required: Vec::new(),
            service,
        }
    }

    /// Attribute columns that must be present and non-empty.
    pub fn require(mut self, column: impl Into<String>) -> Self {
        self.required.push(column.into());
        self
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

impl ImportStrategy for AttributeTableStrategy {
    type Dto = AttributeRow;

    fn transform(&self, raw: &Attributes, tenant_code: &str) -> Result<AttributeRow, Vec<ValidationFailure>> {
        let Some(code) = text(raw.get("code")) else {
            return Err(vec![ValidationFailure::new("code", "is required")]);
        };
        let name = text(raw.get("name")).unwrap_or_else(|| code.clone());
        let attributes = raw
            .iter()
            .filter(|(k, _)| k.as_str() != "code" && k.as_str() != "name")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(AttributeRow {
            pk: encode_partition_key(&self.kind, tenant_code),
            sk: code.clone(),
            code,
            name,
            attributes,
        })
    }

    fn validate(&self, dto: &AttributeRow) -> Result<(), Vec<ValidationFailure>> {
        let failures: Vec<ValidationFailure> = self
            .required
            .iter()
            .filter(|col| text(dto.attributes.get(col.as_str())).is_none())
            .map(|col| ValidationFailure::new(col.clone(), "is required"))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

#[async_trait]
impl ProcessStrategy for AttributeTableStrategy {
    type Dto = AttributeRow;

    async fn compare(&self, dto: &AttributeRow, _tenant_code: &str) -> ImportResult<Comparison> {
        let id = mbc_types::derive_id(&dto.pk, &dto.sk);
        let Some(existing) = self.service.get_latest(&id)? else {
            return Ok(Comparison::not_exist());
        };
        if existing.is_deleted {
            return Ok(Comparison::changed(existing));
        }
        let same = existing.name == dto.name && existing.attributes == dto.attributes;
        Ok(if same {
            Comparison::equal(existing)
        } else {
            Comparison::changed(existing)
        })
    }

    fn map(
        &self,
        status: ComparisonStatus,
        dto: &AttributeRow,
        tenant_code: &str,
        existing: Option<&DataRecord>,
    ) -> Option<CommandInput> {
        let expected = match status {
            ComparisonStatus::NotExist => 0,
            ComparisonStatus::Changed => existing?.version,
            ComparisonStatus::Equal => return None,
        };
        Some(
            CommandInput::new(dto.pk.clone(), dto.sk.clone(), expected)
                .with_tenant(tenant_code)
                .with_kind(self.kind.clone())
                .with_code(dto.code.clone())
                .with_name(dto.name.clone())
                .with_attributes(dto.attributes.clone()),
        )
    }

    fn command_service(&self) -> Arc<CommandService> {
        self.service.clone()
    }
}
