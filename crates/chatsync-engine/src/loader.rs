use std::sync::Arc;

use chatsync_core::{QueryRequest, SyncError, SyncErrorCategory};
use chatsync_platform::RemoteStore;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// One decoded snapshot batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPage<E> {
    pub rows: Vec<E>,
    /// Exact row count of the filtered relation, when requested.
    pub total_count: Option<u64>,
}

/// Fetches ordered snapshot batches from the enriched read views.
#[derive(Clone)]
pub struct SnapshotLoader {
    store: Arc<dyn RemoteStore>,
}

impl SnapshotLoader {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Run one snapshot query. A batch that fails to decode is rejected whole.
    pub async fn load_page<E: DeserializeOwned>(
        &self,
        request: QueryRequest,
    ) -> Result<SnapshotPage<E>, SyncError> {
        let relation = request.relation;
        let page = self.store.query(request).await?;
        let rows = page
            .rows
            .into_iter()
            .map(decode_row)
            .collect::<Result<Vec<E>, _>>()?;
        tracing::trace!(%relation, rows = rows.len(), total = ?page.total_count, "snapshot page loaded");
        Ok(SnapshotPage {
            rows,
            total_count: page.total_count,
        })
    }
}

pub(crate) fn decode_row<E: DeserializeOwned>(row: Value) -> Result<E, SyncError> {
    serde_json::from_value(row).map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Serialization,
            "row_decode_error",
            err.to_string(),
        )
    })
}
