use serde_json::Value;
use tracing::info;

use mbc_command::CommandService;
use mbc_store::PartitionQuery;

use crate::error::{ImportError, ImportResult};

const KEY_COLUMNS: [&str; 5] = ["pk", "sk", "code", "name", "version"];

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Write the live Data Records of partition `pk` as CSV: key columns
/// followed by the requested attribute `columns`.
pub fn export_csv(
    service: &CommandService,
    pk: &str,
    query: &PartitionQuery,
    columns: &[String],
) -> ImportResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let header = KEY_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(columns.iter().cloned());
    writer.write_record(header)?;

    let mut query = query.clone();
    query.cursor = None;
    let mut rows = 0usize;
    loop {
        let page = service.list_items_by_partition(pk, &query)?;
        for item in &page.items {
            let mut record = vec![
                item.pk.clone(),
                item.sk.clone(),
                item.code.clone(),
                item.name.clone(),
                item.version.to_string(),
            ];
            record.extend(columns.iter().map(|c| cell(item.attributes.get(c))));
            writer.write_record(&record)?;
            rows += 1;
        }
        match page.cursor {
            Some(cursor) => query.cursor = Some(cursor),
            None => break,
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ImportError::Csv(e.to_string()))?;
    info!(pk, rows, "partition exported");
    String::from_utf8(bytes).map_err(|e| ImportError::Csv(e.to_string()))
}
