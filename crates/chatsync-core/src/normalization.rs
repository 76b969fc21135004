use crate::{
    error::SyncError,
    types::{ChangeEvent, ChangeOp, MutationAck, MutationKind, ViewEvent},
};

/// Gateway result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The remote store accepted the write.
    Success,
    /// The write was rejected locally or remotely.
    Failure { error: SyncError },
}

impl From<&Result<(), SyncError>> for MutationOutcome {
    fn from(result: &Result<(), SyncError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(error) => Self::Failure {
                error: error.clone(),
            },
        }
    }
}

/// Convert a mutation outcome to a stable `ViewEvent::MutationAck`.
pub fn normalize_mutation_outcome(
    client_txn_id: impl Into<String>,
    kind: MutationKind,
    outcome: MutationOutcome,
) -> ViewEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        MutationOutcome::Success => ViewEvent::MutationAck(MutationAck {
            client_txn_id,
            kind,
            error_code: None,
        }),
        MutationOutcome::Failure { error } => ViewEvent::MutationAck(MutationAck {
            client_txn_id,
            kind,
            error_code: Some(error.code),
        }),
    }
}

/// Identifier-level view of a raw change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveChange {
    pub op: ChangeOp,
    pub id: i64,
}

/// Reduce a raw change to what the reconciler needs.
///
/// Returns `None` when the row image carries no usable identifier.
pub fn normalize_change_event(event: &ChangeEvent) -> Option<LiveChange> {
    let id = event.row.id()?;
    Some(LiveChange { op: event.op, id })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        error::SyncErrorCategory,
        types::{RawRow, Relation},
    };

    fn event(op: ChangeOp, row: serde_json::Value) -> ChangeEvent {
        let serde_json::Value::Object(map) = row else {
            panic!("row must be an object");
        };
        ChangeEvent {
            relation: Relation::Rooms,
            op,
            row: RawRow(map),
        }
    }

    #[test]
    fn maps_success_to_mutation_ack() {
        let ack = normalize_mutation_outcome(
            "txn-1",
            MutationKind::CreateRoom,
            MutationOutcome::Success,
        );

        match ack {
            ViewEvent::MutationAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-1");
                assert_eq!(ack.kind, MutationKind::CreateRoom);
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_ack_with_stable_error_code() {
        let ack = normalize_mutation_outcome(
            "txn-2",
            MutationKind::SendMessage,
            MutationOutcome::from(&Err(SyncError::new(
                SyncErrorCategory::RateLimited,
                "rate_limited",
                "slow down",
            ))),
        );

        match ack {
            ViewEvent::MutationAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-2");
                assert_eq!(ack.error_code.as_deref(), Some("rate_limited"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn extracts_identifier_from_partial_rows() {
        let insert = event(ChangeOp::Insert, json!({ "id": 12, "name": "new" }));
        assert_eq!(
            normalize_change_event(&insert),
            Some(LiveChange {
                op: ChangeOp::Insert,
                id: 12
            })
        );

        let delete = event(ChangeOp::Delete, json!({ "id": 4 }));
        assert_eq!(
            normalize_change_event(&delete).map(|change| change.op),
            Some(ChangeOp::Delete)
        );
    }

    #[test]
    fn drops_rows_without_identifier() {
        assert_eq!(
            normalize_change_event(&event(ChangeOp::Insert, json!({ "id": null }))),
            None
        );
        assert_eq!(
            normalize_change_event(&event(ChangeOp::Delete, json!({}))),
            None
        );
    }
}
