//! Applying sync responses to storage and the room list, and the long-poll
//! loop that fetches them.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use murmur_db::Connection;
use murmur_db::queries::{rooms, state, sync_token, timeline};
use murmur_types::events::{ClientEvent, SyncComplete, SyncRoom, SyncStatus, SyncStatusKind};
use murmur_types::ids::{EventId, EventRowId, RoomId, UserId};
use murmur_types::models::{CurrentStateEntry, EVENT_TYPE_MEMBER, Event, LazyLoadSummary, PrevBatch, Room, RoomListEntry};

use crate::error::ClientError;
use crate::process::{DecryptionQueue, ProcessContext, Source, apply_important_state, process_event, state_entry};
use crate::protocol::{JoinedRoom, RawEvent, SyncResponse};
use crate::room_list::{project, project_all};
use crate::{Client, ClientInner};

const EVENT_TYPE_RECEIPT: &str = "m.receipt";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

enum RoomListUpdate {
    Full(Vec<RoomListEntry>),
    Delta {
        updates: Vec<RoomListEntry>,
        removed: Vec<RoomId>,
    },
}

struct AppliedSync {
    complete: SyncComplete,
    room_list: RoomListUpdate,
    wakeup: bool,
}

/// Whether the own user sent a read receipt, and for which event.
fn own_receipt(ephemeral: &[RawEvent], own_user: &UserId) -> Option<EventId> {
    let mut found = None;
    for evt in ephemeral {
        if evt.event_type.as_deref() != Some(EVENT_TYPE_RECEIPT) {
            continue;
        }
        let Value::Object(receipts) = &evt.content else {
            continue;
        };
        for (event_id, kinds) in receipts {
            let by_own = ["m.read", "m.read.private"]
                .iter()
                .any(|kind| kinds.get(kind).and_then(|users| users.get(own_user.as_str())).is_some());
            if by_own {
                found = Some(EventId::from(event_id.as_str()));
            }
        }
    }
    found
}

/// Local count of unread messages after this batch of newly appended events.
/// Own messages and own receipts reset it; a receipt for an event outside the
/// batch counts as having read everything.
fn unread_messages(previous: u32, batch: &[&Event], own_user: &UserId, receipt: Option<&EventId>) -> u32 {
    let mut count = previous;
    for evt in batch {
        if evt.sender == *own_user && evt.can_be_preview() {
            count = 0;
        } else if evt.unread_type.is_message() {
            count += 1;
        }
    }
    if let Some(receipt) = receipt {
        count = match batch.iter().position(|evt| evt.event_id == *receipt) {
            Some(idx) => batch[idx + 1..]
                .iter()
                .filter(|evt| evt.sender != *own_user && evt.unread_type.is_message())
                .count() as u32,
            None => 0,
        };
    }
    count
}

fn record_state(
    room: &mut Room,
    entries: &mut Vec<CurrentStateEntry>,
    state_map: &mut HashMap<String, HashMap<String, EventRowId>>,
    evt: &Event,
) {
    let Some(entry) = state_entry(evt) else {
        return;
    };
    if evt.event_type != EVENT_TYPE_MEMBER {
        apply_important_state(room, evt);
    }
    state_map
        .entry(entry.event_type.clone())
        .or_default()
        .insert(entry.state_key.clone(), entry.event_rowid);
    entries.push(entry);
}

fn apply_joined_room(
    txn: &Connection,
    ctx: &ProcessContext<'_>,
    room_id: &RoomId,
    joined: JoinedRoom,
    queue: &mut DecryptionQueue,
) -> anyhow::Result<SyncRoom> {
    let mut room = rooms::get_or_create(txn, room_id)?;
    if joined.summary != LazyLoadSummary::default() {
        room.lazy_load_summary
            .get_or_insert_with(LazyLoadSummary::default)
            .merge(&joined.summary);
    }

    let reset = joined.timeline.limited;
    if reset {
        let cleared = timeline::clear(txn, room_id)?;
        debug!("Timeline of {} was limited, cleared {} rows", room_id, cleared);
    }
    if reset || room.prev_batch == PrevBatch::Latest {
        room.prev_batch = PrevBatch::from_token(joined.timeline.prev_batch.clone());
    }

    let summary = room.lazy_load_summary.clone();
    let mut entries = Vec::new();
    let mut state_map = HashMap::new();
    let mut events = Vec::new();

    for raw in joined.state.events {
        if let Some(evt) = process_event(txn, raw, room_id, summary.as_ref(), ctx, queue, Source::State)? {
            record_state(&mut room, &mut entries, &mut state_map, &evt);
            events.push(evt);
        }
    }

    let mut live = Vec::with_capacity(joined.timeline.events.len());
    for raw in joined.timeline.events {
        let Some(evt) = process_event(txn, raw, room_id, summary.as_ref(), ctx, queue, Source::Live)? else {
            continue;
        };
        if evt.is_state() {
            record_state(&mut room, &mut entries, &mut state_map, &evt);
        }
        if evt.can_be_preview() && evt.timestamp >= room.sorting_timestamp {
            room.preview_event_rowid = Some(evt.rowid);
            room.sorting_timestamp = evt.timestamp;
        }
        live.push(evt);
    }
    state::add_many(txn, room_id, false, &entries)?;

    let rowids: Vec<EventRowId> = live.iter().map(|evt| evt.rowid).collect();
    let tuples = timeline::append(txn, room_id, &rowids)?;
    for evt in live.iter_mut() {
        evt.timeline_rowid = tuples
            .iter()
            .find(|t| t.event_rowid == evt.rowid)
            .map(|t| t.timeline_rowid);
    }

    // Redelivered events are already in the timeline and are not counted again.
    let fresh: Vec<&Event> = live.iter().filter(|evt| evt.timeline_rowid.is_some()).collect();
    let receipt = own_receipt(&joined.ephemeral.events, ctx.own_user);
    room.unread_messages = unread_messages(room.unread_messages, &fresh, ctx.own_user, receipt.as_ref());
    if let Some(counts) = joined.unread_notifications {
        room.unread_notifications = counts.notification_count;
        room.unread_highlights = counts.highlight_count;
    } else if receipt.is_some() {
        room.unread_notifications = 0;
        room.unread_highlights = 0;
    }

    rooms::upsert(txn, &room)?;
    events.extend(live);

    Ok(SyncRoom {
        meta: room,
        timeline: tuples,
        state: state_map,
        events,
        reset,
    })
}

fn apply_sync_txn(txn: &Connection, inner: &ClientInner, resp: SyncResponse, populate: bool) -> anyhow::Result<AppliedSync> {
    let ctx = inner.process_ctx();
    let mut queue = DecryptionQueue::default();
    let mut complete = SyncComplete::default();
    let mut touched = Vec::with_capacity(resp.rooms.join.len());

    for (room_id, joined) in resp.rooms.join {
        let sync_room = apply_joined_room(txn, &ctx, &room_id, joined, &mut queue)?;
        touched.push(sync_room.meta.clone());
        complete.rooms.insert(room_id, sync_room);
    }
    for room_id in resp.rooms.leave.into_keys() {
        rooms::delete(txn, &room_id)?;
        complete.rooms.remove(&room_id);
        touched.retain(|room| room.room_id != room_id);
        complete.left_rooms.push(room_id);
    }

    sync_token::set(txn, &resp.next_batch)?;
    let wakeup = queue.persist(txn)?;

    let room_list = if populate {
        RoomListUpdate::Full(project_all(txn)?)
    } else {
        RoomListUpdate::Delta {
            updates: touched
                .iter()
                .map(|room| project(txn, room))
                .collect::<anyhow::Result<_>>()?,
            removed: complete.left_rooms.clone(),
        }
    };

    Ok(AppliedSync {
        complete,
        room_list,
        wakeup,
    })
}

impl Client {
    /// Store one sync response and publish the result. Pagination of any room
    /// whose timeline the response resets is interrupted first.
    pub async fn apply_sync(&self, resp: SyncResponse) -> Result<SyncComplete, ClientError> {
        let _serial = self.inner.sync_lock.lock().await;

        for (room_id, joined) in &resp.rooms.join {
            if joined.timeline.limited && self.inner.interrupter.interrupt(room_id) {
                info!("Interrupted pagination of {} after timeline reset", room_id);
            }
        }

        let populate = !self.inner.lock_room_list().is_populated();
        let applied = self
            .blocking(move |inner| inner.db.transaction(|txn| apply_sync_txn(txn, inner, resp, populate)))
            .await?;

        if applied.wakeup {
            self.wakeup_request_queue();
        }
        let list_changed = {
            let mut list = self.inner.lock_room_list();
            let changed = match applied.room_list {
                RoomListUpdate::Full(entries) => {
                    list.populate(entries);
                    true
                }
                RoomListUpdate::Delta { updates, removed } => list.apply(updates, &removed),
            };
            changed.then(|| list.entries().to_vec())
        };

        debug!(
            "Applied sync with {} rooms, {} left",
            applied.complete.rooms.len(),
            applied.complete.left_rooms.len()
        );
        self.dispatch(ClientEvent::SyncComplete(applied.complete.clone()));
        if let Some(entries) = list_changed {
            self.dispatch(ClientEvent::RoomList(entries));
        }
        Ok(applied.complete)
    }

    async fn sync_once(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let since = self
            .blocking(|inner| inner.db.with_conn(sync_token::get))
            .await?;
        let resp = self.inner.protocol.sync(since.as_deref(), timeout_ms).await?;
        self.apply_sync(resp).await?;
        Ok(())
    }

    /// Long-poll the server until `cancel` fires, backing off on errors and
    /// reporting sync health as `sync_status` events.
    pub async fn run_sync_loop(&self, timeout_ms: u64, cancel: CancellationToken) {
        info!("Sync loop started");
        let mut error_count: u32 = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.sync_once(timeout_ms) => result,
            };
            match result {
                Ok(()) => {
                    if error_count > 0 {
                        info!("Sync recovered after {} errors", error_count);
                        error_count = 0;
                        self.dispatch(ClientEvent::SyncStatus(SyncStatus {
                            kind: SyncStatusKind::Ok,
                            error_count: 0,
                            last_error: None,
                        }));
                    }
                }
                Err(err) => {
                    error_count += 1;
                    let backoff = Duration::from_secs(1u64 << error_count.min(5)).min(MAX_BACKOFF);
                    if error_count == 1 {
                        warn!("Sync failed: {}", err);
                    } else {
                        error!("Sync failed {} times in a row: {}", error_count, err);
                    }
                    self.dispatch(ClientEvent::SyncStatus(SyncStatus {
                        kind: SyncStatusKind::Erroring,
                        error_count,
                        last_error: Some(err.to_string()),
                    }));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    self.dispatch(ClientEvent::SyncStatus(SyncStatus {
                        kind: SyncStatusKind::Waiting,
                        error_count,
                        last_error: Some(err.to_string()),
                    }));
                }
            }
        }
        info!("Sync loop stopped");
    }
}
