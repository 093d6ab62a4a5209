use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use murmur_db::Connection;
use murmur_db::queries::{events, rooms, timeline};
use murmur_types::api::PaginationResponse;
use murmur_types::ids::{EventId, EventRowId, RoomId, TimelineRowId};
use murmur_types::models::{Event, PrevBatch, Room};

use crate::error::ClientError;
use crate::process::{DecryptionQueue, Source, process_event};
use crate::protocol::RawEvent;
use crate::{Client, ClientInner};

/// Cancellation handle of one outstanding server pagination.
#[derive(Clone)]
struct Interruption {
    token: CancellationToken,
    reset: Arc<AtomicBool>,
}

impl Interruption {
    fn error(&self) -> ClientError {
        if self.reset.load(Ordering::Acquire) {
            ClientError::TimelineReset
        } else {
            ClientError::Cancelled
        }
    }

    fn check(&self) -> Result<(), ClientError> {
        if self.token.is_cancelled() { Err(self.error()) } else { Ok(()) }
    }
}

/// Rooms with a server pagination in flight. Holding an entry is what makes
/// pagination single-flight per room.
#[derive(Default)]
pub struct PaginationInterrupter {
    inflight: Mutex<HashMap<RoomId, Interruption>>,
}

impl PaginationInterrupter {
    fn lock(&self) -> MutexGuard<'_, HashMap<RoomId, Interruption>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, room_id: &RoomId, parent: &CancellationToken) -> Result<PaginationGuard<'_>, ClientError> {
        let mut inflight = self.lock();
        if inflight.contains_key(room_id) {
            return Err(ClientError::PaginationInProgress);
        }
        let interruption = Interruption {
            token: parent.child_token(),
            reset: Arc::new(AtomicBool::new(false)),
        };
        inflight.insert(room_id.clone(), interruption.clone());
        Ok(PaginationGuard {
            interrupter: self,
            room_id: room_id.clone(),
            interruption,
        })
    }

    /// Abort the room's in-flight pagination because its timeline was reset.
    pub fn interrupt(&self, room_id: &RoomId) -> bool {
        match self.lock().get(room_id) {
            Some(interruption) => {
                interruption.reset.store(true, Ordering::Release);
                interruption.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_paginating(&self, room_id: &RoomId) -> bool {
        self.lock().contains_key(room_id)
    }
}

/// Removes the interrupter entry on every exit path.
struct PaginationGuard<'a> {
    interrupter: &'a PaginationInterrupter,
    room_id: RoomId,
    interruption: Interruption,
}

impl Drop for PaginationGuard<'_> {
    fn drop(&mut self) {
        self.interrupter.lock().remove(&self.room_id);
    }
}

/// Drop the entries rejected by `keep` from `items` and `rowids` in one pass.
/// Survivors shift left in order, so `items[i]` still pairs with `rowids[i]`.
/// Returns how many entries were dropped.
pub(crate) fn compact_duplicates<T, F>(items: &mut Vec<T>, rowids: &mut Vec<EventRowId>, mut keep: F) -> anyhow::Result<usize>
where
    F: FnMut(&T) -> anyhow::Result<bool>,
{
    if items.len() != rowids.len() {
        bail!("{} events but {} row IDs", items.len(), rowids.len());
    }
    let mut offset = 0;
    for i in 0..items.len() {
        if !keep(&items[i])? {
            offset += 1;
            continue;
        }
        if offset > 0 {
            items.swap(i - offset, i);
            rowids.swap(i - offset, i);
        }
    }
    let kept = items.len() - offset;
    items.truncate(kept);
    rowids.truncate(kept);
    Ok(offset)
}

/// Fail with `TimelineReset` unless the room's stored cursor is still the one
/// the page was fetched with. A reset that raced the fetch replaces it.
fn ensure_cursor(txn: &Connection, room_id: &RoomId, fetched_with: &PrevBatch) -> anyhow::Result<()> {
    let current = rooms::get(txn, room_id)?.map(|r| r.prev_batch);
    if current.as_ref() != Some(fetched_with) {
        warn!(
            "Cursor of {} moved from {:?} to {:?} during pagination, discarding page",
            room_id, fetched_with, current
        );
        return Err(ClientError::TimelineReset.into());
    }
    Ok(())
}

fn check_limit(limit: usize) -> Result<(), ClientError> {
    if limit == 0 {
        return Err(ClientError::InvalidParams("limit must be at least 1".into()));
    }
    Ok(())
}

struct AppliedPage {
    events: Vec<Event>,
    wakeup: bool,
}

fn apply_page(
    txn: &Connection,
    inner: &ClientInner,
    room: &Room,
    chunk: Vec<RawEvent>,
    end: &PrevBatch,
    interruption: &Interruption,
) -> anyhow::Result<AppliedPage> {
    interruption.check()?;
    ensure_cursor(txn, &room.room_id, &room.prev_batch)?;

    let ctx = inner.process_ctx();
    let mut queue = DecryptionQueue::default();
    let mut page = Vec::with_capacity(chunk.len());
    let mut rowids = Vec::with_capacity(chunk.len());
    for raw in chunk {
        let summary = room.lazy_load_summary.as_ref();
        if let Some(evt) = process_event(txn, raw, &room.room_id, summary, &ctx, &mut queue, Source::History)? {
            rowids.push(evt.rowid);
            page.push(evt);
        }
    }

    let mut seen = HashSet::with_capacity(page.len());
    let skipped = compact_duplicates(&mut page, &mut rowids, |evt: &Event| {
        if !seen.insert(evt.rowid) {
            return Ok(false);
        }
        let exists = timeline::has(txn, &room.room_id, evt.rowid)?;
        if exists {
            warn!(
                "Event {} (row {}) already in timeline of {}, skipping",
                evt.event_id, evt.rowid, room.room_id
            );
        }
        Ok(!exists)
    })?;
    if skipped > 0 {
        debug!("Dropped {} duplicate events from page of {}", skipped, room.room_id);
    }

    let wakeup = queue.persist(txn)?;
    events::fill_reaction_counts(txn, &room.room_id, &mut page)?;
    events::fill_last_edit_rowids(txn, &room.room_id, &mut page)?;
    rooms::set_prev_batch(txn, &room.room_id, end)?;

    let tuples = timeline::prepend(txn, &room.room_id, &rowids)?;
    if tuples.len() != page.len() {
        bail!("timeline prepend stored {} of {} events", tuples.len(), page.len());
    }
    for (evt, tuple) in page.iter_mut().zip(&tuples) {
        evt.timeline_rowid = Some(tuple.timeline_rowid);
    }

    // Last chance to back out before commit.
    interruption.check()?;
    Ok(AppliedPage { events: page, wakeup })
}

impl Client {
    /// Events older than `before` from storage, or one page from the server
    /// once storage has nothing older.
    pub async fn paginate(
        &self,
        room_id: &RoomId,
        before: TimelineRowId,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<PaginationResponse, ClientError> {
        check_limit(limit)?;
        let rid = room_id.clone();
        let stored = self
            .blocking(move |inner| {
                inner.db.with_conn(|conn| {
                    let mut page = timeline::get(conn, &rid, before, limit)?;
                    events::fill_reaction_counts(conn, &rid, &mut page)?;
                    events::fill_last_edit_rowids(conn, &rid, &mut page)?;
                    Ok(page)
                })
            })
            .await?;
        if !stored.is_empty() {
            return Ok(PaginationResponse {
                events: stored,
                has_more: true,
            });
        }
        self.paginate_server(room_id, limit, cancel).await
    }

    /// Fetch one page of history from the server and prepend it to the
    /// stored timeline.
    pub async fn paginate_server(
        &self,
        room_id: &RoomId,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<PaginationResponse, ClientError> {
        check_limit(limit)?;
        let guard = self.inner.interrupter.begin(room_id, cancel)?;
        let interruption = guard.interruption.clone();

        let rid = room_id.clone();
        let room = self
            .blocking(move |inner| inner.db.with_conn(|conn| rooms::get(conn, &rid)))
            .await?
            .ok_or_else(|| ClientError::RoomNotFound(room_id.clone()))?;
        if room.prev_batch.is_complete() {
            return Ok(PaginationResponse::exhausted());
        }

        interruption.check()?;
        let resp = tokio::select! {
            _ = interruption.token.cancelled() => return Err(interruption.error()),
            resp = self.inner.protocol.messages(room_id, room.prev_batch.as_token(), limit) => resp?,
        };

        let end = match resp.end {
            Some(token) if !token.is_empty() => PrevBatch::Token(token),
            _ => PrevBatch::Complete,
        };
        if end.is_complete() || resp.chunk.is_empty() {
            let has_more = !end.is_complete();
            if !has_more {
                info!("Reached the start of {}", room_id);
            }
            let rid = room_id.clone();
            let fetched_with = room.prev_batch;
            self.blocking(move |inner| {
                inner.db.transaction(|txn| {
                    interruption.check()?;
                    ensure_cursor(txn, &rid, &fetched_with)?;
                    rooms::set_prev_batch(txn, &rid, &end)
                })
            })
            .await?;
            return Ok(PaginationResponse {
                events: Vec::new(),
                has_more,
            });
        }

        let chunk = resp.chunk;
        let applied = self
            .blocking(move |inner| {
                inner
                    .db
                    .transaction(|txn| apply_page(txn, inner, &room, chunk, &end, &interruption))
            })
            .await?;
        drop(guard);

        if applied.wakeup {
            self.wakeup_request_queue();
        }
        debug!("Prepended {} events to {}", applied.events.len(), room_id);
        Ok(PaginationResponse {
            events: applied.events,
            has_more: true,
        })
    }

    /// A single event from storage, falling back to the server. Events fetched
    /// remotely are stored without a timeline position.
    pub async fn get_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        cancel: &CancellationToken,
    ) -> Result<Event, ClientError> {
        let (rid, eid) = (room_id.clone(), event_id.clone());
        let stored = self
            .blocking(move |inner| {
                inner.db.with_conn(|conn| {
                    let Some(evt) = events::get_by_id(conn, &eid)? else {
                        return Ok(None);
                    };
                    let mut one = [evt];
                    events::fill_reaction_counts(conn, &rid, &mut one)?;
                    events::fill_last_edit_rowids(conn, &rid, &mut one)?;
                    let [evt] = one;
                    Ok(Some(evt))
                })
            })
            .await?;
        if let Some(evt) = stored {
            return Ok(evt);
        }

        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            raw = self.inner.protocol.event(room_id, event_id) => raw?,
        };
        let rid = room_id.clone();
        let (processed, wakeup) = self
            .blocking(move |inner| {
                inner.db.transaction(|txn| {
                    let room = rooms::get(txn, &rid)?;
                    let summary = room.as_ref().and_then(|r| r.lazy_load_summary.as_ref());
                    let mut queue = DecryptionQueue::default();
                    let evt = process_event(txn, raw, &rid, summary, &inner.process_ctx(), &mut queue, Source::Lookup)?;
                    Ok((evt, queue.persist(txn)?))
                })
            })
            .await?;
        if wakeup {
            self.wakeup_request_queue();
        }
        processed.ok_or_else(|| ClientError::EventNotFound(event_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_keeps_index_correspondence() {
        let mut items = vec!["a", "dup1", "b", "dup2", "dup3", "c", "d", "dup4"];
        let mut rowids: Vec<EventRowId> = (1..=8).map(EventRowId).collect();
        let dropped = compact_duplicates(&mut items, &mut rowids, |item| Ok(!item.starts_with("dup"))).unwrap();

        assert_eq!(dropped, 4);
        assert_eq!(items, vec!["a", "b", "c", "d"]);
        assert_eq!(rowids, vec![EventRowId(1), EventRowId(3), EventRowId(6), EventRowId(7)]);
    }

    #[test]
    fn compaction_of_all_duplicates_empties_both() {
        let mut items = vec![1, 2, 3];
        let mut rowids: Vec<EventRowId> = (1..=3).map(EventRowId).collect();
        let dropped = compact_duplicates(&mut items, &mut rowids, |_| Ok(false)).unwrap();
        assert_eq!(dropped, 3);
        assert!(items.is_empty());
        assert!(rowids.is_empty());
    }

    #[test]
    fn compaction_without_duplicates_is_identity() {
        let mut items = vec![10, 20, 30];
        let mut rowids: Vec<EventRowId> = (1..=3).map(EventRowId).collect();
        compact_duplicates(&mut items, &mut rowids, |_| Ok(true)).unwrap();
        assert_eq!(items, vec![10, 20, 30]);
        assert_eq!(rowids.len(), 3);
    }

    #[test]
    fn interrupter_is_single_flight_and_cleans_up() {
        let interrupter = PaginationInterrupter::default();
        let room: RoomId = "!r:x".into();
        let parent = CancellationToken::new();

        let guard = interrupter.begin(&room, &parent).unwrap();
        assert!(matches!(
            interrupter.begin(&room, &parent),
            Err(ClientError::PaginationInProgress)
        ));
        assert!(interrupter.is_paginating(&room));

        assert!(interrupter.interrupt(&room));
        assert!(matches!(guard.interruption.check(), Err(ClientError::TimelineReset)));
        drop(guard);

        assert!(!interrupter.is_paginating(&room));
        assert!(!interrupter.interrupt(&room));
        let again = interrupter.begin(&room, &parent).unwrap();
        parent.cancel();
        assert!(matches!(again.interruption.check(), Err(ClientError::Cancelled)));
    }
}
