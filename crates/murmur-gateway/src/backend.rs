use async_trait::async_trait;

use murmur_client::commands::CommandContext;
use murmur_client::{Client, SortCursor};
use murmur_types::events::{ClientState, JsonCommand, SyncRoom};

/// What a frontend connection needs from the sync engine.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn client_state(&self) -> ClientState;

    /// Rooms older than `after` (all rooms when `None`), newest first.
    async fn initial_room_batch(&self, after: Option<SortCursor>, limit: usize) -> anyhow::Result<Vec<SyncRoom>>;

    async fn submit_json_command(&self, cmd: JsonCommand, ctx: &CommandContext<'_>) -> JsonCommand;
}

#[async_trait]
impl Backend for Client {
    fn client_state(&self) -> ClientState {
        self.state()
    }

    async fn initial_room_batch(&self, after: Option<SortCursor>, limit: usize) -> anyhow::Result<Vec<SyncRoom>> {
        Ok(Client::initial_room_batch(self, after, limit).await?)
    }

    async fn submit_json_command(&self, cmd: JsonCommand, ctx: &CommandContext<'_>) -> JsonCommand {
        Client::submit_json_command(self, cmd, ctx).await
    }
}
