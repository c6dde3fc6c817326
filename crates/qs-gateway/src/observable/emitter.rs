//! Handle a query executor uses to push values into its observable.

use std::fmt;
use std::sync::Weak;

use qs_wire::Payload;
use serde_json::Value;

use super::table::ObservableTable;
use crate::ports::FunctionError;

/// One value emitted by a query executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub data: Payload,
    /// Computed from `data` when absent
    pub checksum: Option<u64>,
    /// Pre-computed patch and the checksum it applies to
    pub patch: Option<(u64, Value)>,
}

impl Update {
    pub fn new(data: impl Into<Payload>) -> Self {
        Self {
            data: data.into(),
            checksum: None,
            patch: None,
        }
    }

    pub fn with_checksum(mut self, checksum: u64) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Supply the patch from `previous_checksum` instead of letting the table diff.
    pub fn with_patch(mut self, previous_checksum: u64, patch: Value) -> Self {
        self.patch = Some((previous_checksum, patch));
        self
    }
}

impl From<Payload> for Update {
    fn from(data: Payload) -> Self {
        Self::new(data)
    }
}

impl From<Value> for Update {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

/// Emits into one observable instance.
///
/// Bound to the executor generation that received it: after a restart or
/// destroy every call is a silent no-op returning `false`.
#[derive(Clone)]
pub struct ObservableEmitter {
    table: Weak<ObservableTable>,
    id: u64,
    generation: u64,
}

impl ObservableEmitter {
    pub(crate) fn new(table: Weak<ObservableTable>, id: u64, generation: u64) -> Self {
        Self {
            table,
            id,
            generation,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Push a new value. Returns `false` once the observable is gone.
    pub fn update(&self, update: impl Into<Update>) -> bool {
        self.table
            .upgrade()
            .is_some_and(|t| t.on_update(self.id, self.generation, update.into()))
    }

    /// Report a failure to every subscriber.
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

impl fmt::Debug for ObservableEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableEmitter")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}
