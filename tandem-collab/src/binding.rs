//! Editor binding: keeps a text widget and a [`Replica`] in step.
//!
//! ```text
//!   widget edit ──on_local_edit──► Replica::delete + insert ──► ops out
//!   ops in ──apply_remote──► Replica::merge ──► visible TextEdits ──► widget
//! ```
//!
//! Local edits are never written back to the widget; it already shows them.
//! Ops that bounce back from the relay are already known to the replica, so
//! their merge produces no visible edits and nothing loops.

use std::ops::Range;

use tandem_core::{MergeOutcome, Op, Replica, ReplicaError, TextEdit};

use crate::diff::minimal_edit;
use crate::presence::Selection;

/// The editor surface the binding drives. Offsets are in chars.
pub trait TextWidget {
    fn text(&self) -> String;

    /// Apply an edit programmatically. Must not move the caret; the binding
    /// positions it afterwards.
    fn apply_edit(&mut self, edit: &TextEdit);

    fn caret(&self) -> usize;

    fn set_caret(&mut self, offset: usize);

    fn selection(&self) -> Option<Selection>;

    fn set_selection(&mut self, selection: Option<Selection>);
}

/// `String`-backed widget for headless clients and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferWidget {
    text: String,
    caret: usize,
    selection: Option<Selection>,
}

impl BufferWidget {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            caret: 0,
            selection: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Simulate the user typing: edit the buffer, put the caret after the
    /// inserted text and return the event to feed to
    /// [`EditorBinding::on_local_edit`].
    pub fn user_edit(&mut self, offset: usize, deleted: usize, inserted: &str) -> TextEdit {
        let edit = TextEdit::new(offset, deleted, inserted);
        edit.apply_to(&mut self.text);
        self.caret = offset + edit.inserted_len();
        self.selection = None;
        edit
    }
}

impl TextWidget for BufferWidget {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn apply_edit(&mut self, edit: &TextEdit) {
        edit.apply_to(&mut self.text);
    }

    fn caret(&self) -> usize {
        self.caret
    }

    fn set_caret(&mut self, offset: usize) {
        self.caret = offset.min(self.text.chars().count());
    }

    fn selection(&self) -> Option<Selection> {
        self.selection
    }

    fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection.filter(|s| !s.is_empty());
    }
}

/// Where `pos` ends up after `edit` is applied.
///
/// Inserts at or before `pos` push it right; deletes wholly before it pull
/// it left; a delete spanning it moves it to the delete start.
pub fn shift_offset(pos: usize, edit: &TextEdit) -> usize {
    let mut pos = pos;
    if edit.deleted > 0 {
        if edit.deleted_end() <= pos {
            pos -= edit.deleted;
        } else if edit.offset < pos {
            pos = edit.offset;
        }
    }
    if edit.offset <= pos {
        pos += edit.inserted_len();
    }
    pos
}

fn overlaps(selection: &Selection, edit: &TextEdit) -> bool {
    let deletes_inside =
        edit.deleted > 0 && edit.offset < selection.end && edit.deleted_end() > selection.start;
    let inserts_inside = !edit.inserted.is_empty()
        && selection.start < edit.offset
        && edit.offset < selection.end;
    deletes_inside || inserts_inside
}

/// Owns the replica and the widget for one open document.
pub struct EditorBinding<W: TextWidget> {
    replica: Replica,
    widget: W,
}

impl<W: TextWidget> EditorBinding<W> {
    /// Bind `widget` to `replica`, bringing the widget's text in line with
    /// the replica first.
    pub fn new(replica: Replica, widget: W) -> Self {
        let mut binding = Self { replica, widget };
        binding.resync();
        binding
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn widget(&self) -> &W {
        &self.widget
    }

    pub fn widget_mut(&mut self) -> &mut W {
        &mut self.widget
    }

    pub fn into_parts(self) -> (Replica, W) {
        (self.replica, self.widget)
    }

    /// Record an edit the widget has already applied. Returns the ops to
    /// broadcast.
    pub fn on_local_edit(&mut self, edit: &TextEdit) -> Result<Vec<Op>, ReplicaError> {
        let mut ops = Vec::with_capacity(edit.deleted + edit.inserted.len());
        if edit.deleted > 0 {
            let range: Range<usize> = edit.offset..edit.deleted_end();
            ops.extend(self.replica.delete(range)?);
        }
        if !edit.inserted.is_empty() {
            ops.extend(self.replica.insert(edit.offset, &edit.inserted)?);
        }
        Ok(ops)
    }

    /// Merge remote ops and replay their visible effect on the widget.
    pub fn apply_remote(&mut self, ops: impl IntoIterator<Item = Op>) -> MergeOutcome {
        let outcome = self.replica.merge(ops);
        for edit in &outcome.edits {
            self.apply_visible(edit);
        }
        if outcome.changed_text() && self.widget.text().chars().count() != self.replica.len() {
            log::warn!("Widget drifted from replica, resyncing");
            self.resync();
        }
        outcome
    }

    /// Bring the widget back in line with the replica with one minimal edit.
    pub fn resync(&mut self) -> Option<TextEdit> {
        let edit = minimal_edit(&self.widget.text(), &self.replica.snapshot())?;
        self.apply_visible(&edit);
        Some(edit)
    }

    fn apply_visible(&mut self, edit: &TextEdit) {
        let caret = self.widget.caret();
        let selection = self.widget.selection();

        self.widget.apply_edit(edit);

        match selection {
            Some(sel) if overlaps(&sel, edit) => {
                let start = shift_offset(sel.start, edit);
                self.widget.set_selection(None);
                self.widget.set_caret(start);
            }
            Some(sel) => {
                self.widget.set_selection(Some(Selection::new(
                    shift_offset(sel.start, edit),
                    shift_offset(sel.end, edit),
                )));
                self.widget.set_caret(shift_offset(caret, edit));
            }
            None => self.widget.set_caret(shift_offset(caret, edit)),
        }
    }
}
