//! Change events delivered by the board's change stream.

use crate::element::{Element, ElementId, UserId};

/// Which kind of change a stream event or echo entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One inbound change for the open board.
///
/// Inserts and updates carry the element's full current row. A delete
/// carries what survived of the last-known row: always the id, and the
/// row's author when the stream provides it. The author is not the user
/// who deleted it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(Element),
    Update(Element),
    Delete {
        id: ElementId,
        /// Author of the deleted row, if the stream reported one.
        author: Option<UserId>,
    },
}

impl ChangeEvent {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// Id of the element the event refers to.
    #[must_use]
    pub fn element_id(&self) -> ElementId {
        match self {
            Self::Insert(element) | Self::Update(element) => element.id,
            Self::Delete { id, .. } => *id,
        }
    }
}

/// An item yielded by a change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Change(ChangeEvent),
    /// The transport re-established its subscription after a drop. Events
    /// may have been missed in between.
    Reconnected,
}
