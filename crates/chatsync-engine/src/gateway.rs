use std::sync::Arc;

use chatsync_core::{Mutation, MutationKind, Relation, RowFilter, SyncError, SyncErrorCategory};
use chatsync_platform::{RemoteStore, SessionProvider};
use serde_json::json;

/// Performs remote writes. Never touches a view collection: the resulting
/// change event is the only way a write becomes visible.
#[derive(Clone)]
pub struct MutationGateway {
    session: Arc<dyn SessionProvider>,
    store: Arc<dyn RemoteStore>,
}

impl MutationGateway {
    pub fn new(session: Arc<dyn SessionProvider>, store: Arc<dyn RemoteStore>) -> Self {
        Self { session, store }
    }

    /// Local input checks, run before any remote call.
    pub fn validate(mutation: &Mutation) -> Result<(), SyncError> {
        match mutation {
            Mutation::CreateRoom { name } if name.trim().is_empty() => Err(
                SyncError::validation("empty_room_name", "room name must not be blank"),
            ),
            Mutation::SendMessage { content, .. } if content.trim().is_empty() => Err(
                SyncError::validation("empty_message", "message must not be blank"),
            ),
            _ => Ok(()),
        }
    }

    pub async fn execute(&self, mutation: Mutation) -> Result<(), SyncError> {
        Self::validate(&mutation)?;
        let kind = mutation.kind();
        let session = self
            .session
            .current_session()
            .await?
            .ok_or_else(|| SyncError::not_signed_in(action_label(kind)))?;

        match mutation {
            Mutation::CreateRoom { name } => {
                self.store
                    .insert(Relation::Rooms, json!({ "name": name }))
                    .await
            }
            Mutation::DeleteRoom {
                room_id,
                known_owner,
            } => {
                if let Some(owner) = known_owner
                    && owner != session.user_id
                {
                    return Err(SyncError::new(
                        SyncErrorCategory::Auth,
                        "not_room_owner",
                        format!("room {room_id} belongs to another user"),
                    ));
                }
                self.store
                    .delete(Relation::Rooms, RowFilter::eq("id", room_id.0))
                    .await
            }
            Mutation::SendMessage { room_id, content } => {
                self.store
                    .insert(
                        Relation::Messages,
                        json!({ "room_id": room_id.0, "content": content }),
                    )
                    .await
            }
        }
    }
}

fn action_label(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::CreateRoom => "create_room",
        MutationKind::DeleteRoom => "delete_room",
        MutationKind::SendMessage => "send_message",
    }
}

#[cfg(test)]
mod tests {
    use chatsync_core::RoomId;
    use chatsync_platform::{InMemoryClient, InMemoryServer};

    use super::*;

    fn gateway(client: &InMemoryClient) -> MutationGateway {
        let client = Arc::new(client.clone());
        MutationGateway::new(client.clone(), client)
    }

    #[test]
    fn rejects_blank_input_locally() {
        let err = MutationGateway::validate(&Mutation::CreateRoom {
            name: "  \t".into(),
        })
        .expect_err("blank name");
        assert_eq!(err.code, "empty_room_name");
        assert!(err.is_local());

        let err = MutationGateway::validate(&Mutation::SendMessage {
            room_id: RoomId(1),
            content: "\n".into(),
        })
        .expect_err("blank content");
        assert_eq!(err.code, "empty_message");
    }

    #[tokio::test]
    async fn blank_names_never_reach_the_store() {
        let server = InMemoryServer::new();
        let client = server.connect();
        client
            .sign_up("kate@example.org", "password1")
            .await
            .expect("sign up");

        let err = gateway(&client)
            .execute(Mutation::CreateRoom { name: " ".into() })
            .await
            .expect_err("blank name");
        assert_eq!(err.code, "empty_room_name");
        assert_eq!(server.room_count(), 0);
    }

    #[tokio::test]
    async fn requires_a_session() {
        let server = InMemoryServer::new();
        let err = gateway(&server.connect())
            .execute(Mutation::CreateRoom {
                name: "lobby".into(),
            })
            .await
            .expect_err("signed out");
        assert_eq!(err.code, "not_signed_in");
        assert!(err.message.contains("create_room"));
    }

    #[tokio::test]
    async fn refuses_to_delete_rooms_known_to_belong_to_someone_else() {
        let server = InMemoryServer::new();
        let owner = server.connect();
        let owner_session = owner
            .sign_up("liam@example.org", "password1")
            .await
            .expect("sign up");
        let room_id = server.seed_room(&owner_session, "mine").expect("seed");

        let other = server.connect();
        other
            .sign_up("mia@example.org", "password1")
            .await
            .expect("sign up");

        let err = gateway(&other)
            .execute(Mutation::DeleteRoom {
                room_id,
                known_owner: Some(owner_session.user_id),
            })
            .await
            .expect_err("foreign room");
        assert_eq!(err.code, "not_room_owner");
        assert_eq!(server.room_count(), 1);

        gateway(&owner)
            .execute(Mutation::DeleteRoom {
                room_id,
                known_owner: Some(owner_session.user_id),
            })
            .await
            .expect("owner delete");
        assert_eq!(server.room_count(), 0);
    }

    #[tokio::test]
    async fn remote_enforces_ownership_when_owner_is_unknown() {
        let server = InMemoryServer::new();
        let owner = server
            .connect()
            .sign_up("noah@example.org", "password1")
            .await
            .expect("sign up");
        let room_id = server.seed_room(&owner, "remote").expect("seed");

        let other = server.connect();
        other
            .sign_up("olga@example.org", "password1")
            .await
            .expect("sign up");
        let err = gateway(&other)
            .execute(Mutation::DeleteRoom {
                room_id,
                known_owner: None,
            })
            .await
            .expect_err("remote rejects");
        assert_eq!(err.code, "permission_denied");
    }
}
