//! Pending operations keyed by message id.

use std::collections::HashMap;
use std::fmt;

use crate::observer::Completion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Subscribe => "subscribe",
            OpKind::Unsubscribe => "unsubscribe",
            OpKind::Publish => "publish",
        })
    }
}

/// An issued operation awaiting its acknowledgment.
///
/// SUBACK and UNSUBACK do not echo the topic, so it is kept here.
pub(crate) enum PendingOp {
    Subscribe {
        topic: String,
        completion: Option<Completion>,
    },
    Unsubscribe {
        topic: String,
        completion: Option<Completion>,
    },
    Publish {
        completion: Option<Completion>,
    },
}

impl PendingOp {
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            PendingOp::Subscribe { .. } => OpKind::Subscribe,
            PendingOp::Unsubscribe { .. } => OpKind::Unsubscribe,
            PendingOp::Publish { .. } => OpKind::Publish,
        }
    }
}

/// Message id to pending operation. Every record leaves the table exactly
/// once: through [`take`](Self::take), [`discard`](Self::discard) or
/// [`purge`](Self::purge).
#[derive(Default)]
pub(crate) struct CorrelationTable {
    ops: HashMap<u16, PendingOp>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record an operation. Returns the record it displaced, if the engine
    /// reused a mid that was still pending.
    pub(crate) fn insert(&mut self, mid: u16, op: PendingOp) -> Option<PendingOp> {
        self.ops.insert(mid, op)
    }

    /// Remove the record for `mid` if it is of the expected kind.
    pub(crate) fn take(&mut self, mid: u16, kind: OpKind) -> Option<PendingOp> {
        match self.ops.get(&mid) {
            Some(op) if op.kind() == kind => self.ops.remove(&mid),
            _ => None,
        }
    }

    /// Remove whatever is recorded for `mid`, releasing its completion.
    pub(crate) fn discard(&mut self, mid: u16) -> bool {
        self.ops.remove(&mid).is_some()
    }

    /// Drop every record. Returns how many were pending.
    pub(crate) fn purge(&mut self) -> usize {
        let count = self.ops.len();
        self.ops.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }
}
