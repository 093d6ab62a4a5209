use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use murmur_client::SortCursor;
use murmur_types::events::{ClientEvent, JsonCommand, SyncComplete};

use crate::backend::Backend;

/// Stream every stored room to a new frontend as `sync_complete` pushes of
/// at most `batch_size` rooms, most recently active first.
pub(crate) async fn send_initial_data(
    backend: &dyn Backend,
    out: &mpsc::Sender<JsonCommand>,
    batch_size: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<usize> {
    let mut cursor: Option<SortCursor> = None;
    let mut total = 0;
    loop {
        if cancel.is_cancelled() {
            debug!("Initial data cancelled after {} rooms", total);
            return Ok(total);
        }
        let rooms = backend.initial_room_batch(cursor.take(), batch_size).await?;
        let Some(last) = rooms.last() else {
            break;
        };
        cursor = Some(SortCursor::after(&last.meta));

        let count = rooms.len();
        let complete = SyncComplete {
            rooms: rooms
                .into_iter()
                .map(|room| (room.meta.room_id.clone(), room))
                .collect(),
            left_rooms: Vec::new(),
        };
        out.send(ClientEvent::SyncComplete(complete).to_command()?).await?;
        total += count;
        if count < batch_size {
            break;
        }
    }
    debug!("Sent initial data for {} rooms", total);
    Ok(total)
}
