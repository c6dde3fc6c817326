use std::fmt;
use std::sync::Weak;

use qs_wire::Payload;

use super::table::ChannelTable;
use crate::ports::FunctionError;

/// Publishes into one channel instance.
///
/// Like the observable emitter it is bound to a publisher generation and goes
/// quiet once the channel is destroyed or restarted.
#[derive(Clone)]
pub struct ChannelEmitter {
    table: Weak<ChannelTable>,
    id: u64,
    generation: u64,
}

impl ChannelEmitter {
    pub(crate) fn new(table: Weak<ChannelTable>, id: u64, generation: u64) -> Self {
        Self {
            table,
            id,
            generation,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fan `message` out to current subscribers. Returns `false` once closed.
    pub fn publish(&self, message: impl Into<Payload>) -> bool {
        self.table
            .upgrade()
            .is_some_and(|t| t.on_publish(self.id, self.generation, message.into()))
    }

    pub fn error(&self, error: FunctionError) -> bool {
        self.table
            .upgrade()
            .is_some_and(|t| t.on_error(self.id, self.generation, error))
    }

    pub fn is_closed(&self) -> bool {
        self.table
            .upgrade()
            .map_or(true, |t| !t.is_current(self.id, self.generation))
    }
}

impl fmt::Debug for ChannelEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEmitter")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}
