use libloam_core::EventId;
use serde::Serialize;

/// Id boundary separating confirmed entries from the rest.
///
/// Only ever moves forward: confirmations may arrive out of order, the
/// cursor is the max confirmed id seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCursor(Option<EventId>);

impl SyncCursor {
    pub fn new(at: Option<EventId>) -> Self {
        Self(at)
    }

    pub fn get(&self) -> Option<EventId> {
        self.0
    }

    /// Move to `id` if it is past the current position. Returns whether the
    /// cursor moved.
    pub fn advance(&mut self, id: EventId) -> bool {
        match self.0 {
            Some(current) if current >= id => false,
            _ => {
                self.0 = Some(id);
                true
            }
        }
    }

    /// Whether `id` is at or behind the cursor
    pub fn covers(&self, id: &EventId) -> bool {
        self.0.map_or(false, |current| *id <= current)
    }
}
