//! Character ops and visible text edits.

use serde::{Deserialize, Serialize};

use crate::id::OpId;

/// The atomic unit of the replicated sequence.
///
/// Insertions carry their causal predecessor (`origin`) and a Lamport value
/// strictly greater than the origin's; deletions are tombstones pointing at
/// a previously inserted character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Insert {
        id: OpId,
        /// Causal predecessor; `None` anchors at the document start.
        origin: Option<OpId>,
        lamport: u64,
        content: char,
    },
    Delete {
        id: OpId,
        /// The insertion being tombstoned.
        target: OpId,
    },
}

impl Op {
    pub fn id(&self) -> OpId {
        match self {
            Op::Insert { id, .. } | Op::Delete { id, .. } => *id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Op::Insert { .. })
    }

    /// The op this one cannot be integrated without.
    pub fn dependency(&self) -> Option<OpId> {
        match self {
            Op::Insert { origin, .. } => *origin,
            Op::Delete { target, .. } => Some(*target),
        }
    }
}

/// A plain-text edit in visible-character offsets.
///
/// The shape editor widgets speak: at `offset`, remove `deleted` characters
/// and then insert `inserted`. Offsets count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextEdit {
    pub offset: usize,
    pub deleted: usize,
    pub inserted: String,
}

impl TextEdit {
    pub fn new(offset: usize, deleted: usize, inserted: impl Into<String>) -> Self {
        Self {
            offset,
            deleted,
            inserted: inserted.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::new(offset, 0, text)
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self::new(offset, len, String::new())
    }

    /// Number of inserted characters.
    pub fn inserted_len(&self) -> usize {
        self.inserted.chars().count()
    }

    /// Net change in document length.
    pub fn net_shift(&self) -> isize {
        self.inserted_len() as isize - self.deleted as isize
    }

    pub fn is_noop(&self) -> bool {
        self.deleted == 0 && self.inserted.is_empty()
    }

    /// End of the replaced region in pre-edit offsets.
    pub fn deleted_end(&self) -> usize {
        self.offset + self.deleted
    }

    /// Apply this edit to a `String`, interpreting offsets as char positions.
    ///
    /// Offsets past the end are clamped.
    pub fn apply_to(&self, text: &mut String) {
        let start = byte_offset(text, self.offset);
        let end = byte_offset(text, self.offset + self.deleted);
        text.replace_range(start..end, &self.inserted);
    }
}

/// Byte index of the `chars`-th character, clamped to the string length.
pub fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ReplicaId;

    #[test]
    fn test_op_accessors() {
        let r = ReplicaId::random();
        let ins = Op::Insert {
            id: OpId::new(r, 1),
            origin: None,
            lamport: 1,
            content: 'a',
        };
        let del = Op::Delete {
            id: OpId::new(r, 2),
            target: OpId::new(r, 1),
        };
        assert!(ins.is_insert());
        assert!(!del.is_insert());
        assert_eq!(ins.dependency(), None);
        assert_eq!(del.dependency(), Some(OpId::new(r, 1)));
        assert_eq!(del.id().seq, 2);
    }

    #[test]
    fn test_text_edit_apply_unicode() {
        let mut text = String::from("héllo");
        TextEdit::new(1, 1, "e").apply_to(&mut text);
        assert_eq!(text, "hello");

        TextEdit::insert(5, " wörld").apply_to(&mut text);
        assert_eq!(text, "hello wörld");

        TextEdit::delete(0, 6).apply_to(&mut text);
        assert_eq!(text, "wörld");
    }

    #[test]
    fn test_text_edit_shift() {
        assert_eq!(TextEdit::insert(0, "abc").net_shift(), 3);
        assert_eq!(TextEdit::delete(2, 5).net_shift(), -5);
        assert_eq!(TextEdit::new(2, 1, "xy").net_shift(), 1);
        assert!(TextEdit::default().is_noop());
    }
}
