use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use murmur_db::queries::{rooms, state};
use murmur_types::events::{ClientEvent, SyncComplete, SyncRoom};
use murmur_types::ids::RoomId;
use murmur_types::models::{EVENT_TYPE_MEMBER, Event, Room};

use crate::Client;
use crate::error::ClientError;
use crate::process::{DecryptionQueue, Source, apply_important_state, process_event, state_entry};

impl Client {
    /// Current state of a room, optionally re-pulled from the server first.
    ///
    /// With `include_members` the refresh runs before returning. Otherwise it
    /// runs in the background and a changed room is pushed as `sync_complete`.
    pub async fn get_room_state(
        &self,
        room_id: &RoomId,
        include_members: bool,
        fetch_members: bool,
        refetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>, ClientError> {
        if fetch_members || refetch {
            if include_members {
                self.refresh_room_state(room_id, refetch, false, cancel).await?;
            } else {
                let client = self.clone();
                let rid = room_id.clone();
                let token = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(err) = client.refresh_room_state(&rid, refetch, true, &token).await {
                        error!("Failed to refresh state of {} in background: {}", rid, err);
                    }
                });
            }
        }

        let rid = room_id.clone();
        self.blocking(move |inner| inner.db.with_conn(|conn| state::get_all(conn, &rid, include_members)))
            .await
    }

    /// Pull state (`refetch`) or members from the server and store it.
    /// Returns the updated room when its metadata changed.
    async fn refresh_room_state(
        &self,
        room_id: &RoomId,
        refetch: bool,
        dispatch: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Room>, ClientError> {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            fetched = async {
                if refetch {
                    self.inner.protocol.state(room_id).await
                } else {
                    self.inner.protocol.members(room_id).await
                }
            } => fetched?,
        };
        debug!("Fetched {} state events for {}", fetched.len(), room_id);

        let rid = room_id.clone();
        let token = cancel.clone();
        let (changed, wakeup) = self
            .blocking(move |inner| {
                inner.db.transaction(|txn| {
                    if token.is_cancelled() {
                        return Err(ClientError::Cancelled.into());
                    }
                    let room = rooms::get(txn, &rid)?.ok_or_else(|| ClientError::RoomNotFound(rid.clone()))?;
                    let mut updated = room.clone();
                    updated.has_member_list = true;

                    let ctx = inner.process_ctx();
                    let mut queue = DecryptionQueue::default();
                    let mut entries = Vec::with_capacity(fetched.len());
                    for raw in fetched {
                        if raw.state_key.is_none() {
                            continue;
                        }
                        let summary = room.lazy_load_summary.as_ref();
                        let Some(evt) = process_event(txn, raw, &rid, summary, &ctx, &mut queue, Source::State)? else {
                            continue;
                        };
                        if evt.event_type != EVENT_TYPE_MEMBER {
                            apply_important_state(&mut updated, &evt);
                        }
                        entries.extend(state_entry(&evt));
                    }
                    state::add_many(txn, &rid, refetch, &entries)?;

                    let changed = updated != room;
                    if changed {
                        rooms::upsert(txn, &updated)?;
                    }
                    let wakeup = queue.persist(txn)?;
                    if token.is_cancelled() {
                        return Err(ClientError::Cancelled.into());
                    }
                    Ok((changed.then_some(updated), wakeup))
                })
            })
            .await?;

        if wakeup {
            self.wakeup_request_queue();
        }
        if let Some(room) = &changed {
            if dispatch {
                let mut complete = SyncComplete::default();
                complete
                    .rooms
                    .insert(room.room_id.clone(), SyncRoom::meta_only(room.clone()));
                self.dispatch(ClientEvent::SyncComplete(complete));
            }
        }
        Ok(changed)
    }
}
