use crate::model::Record;

/// The selected row. `anchor` (a torrent hash) is authoritative; `cursor` is
/// re-derived from it whenever the visible order changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    pub cursor: usize,
    pub anchor: Option<String>,
}

impl SelectionState {
    /// Follows the anchored hash into `order`, falling back to the first row.
    pub fn reanchor(&mut self, order: &[&Record]) {
        *self = reanchor(self.anchor.as_deref(), order);
    }

    pub fn move_by(&mut self, delta: isize, order: &[&Record]) {
        if order.is_empty() {
            *self = SelectionState::default();
            return;
        }
        let max_index = order.len() as isize - 1;
        let next = (self.cursor as isize + delta).clamp(0, max_index) as usize;
        self.select_index(next, order);
    }

    pub fn select_index(&mut self, index: usize, order: &[&Record]) {
        match order.get(index) {
            Some(record) => {
                self.cursor = index;
                self.anchor = Some(record.hash.clone());
            }
            None => *self = SelectionState::default(),
        }
    }

    pub fn select_last(&mut self, order: &[&Record]) {
        self.select_index(order.len().saturating_sub(1), order);
    }

    pub fn selected(&self) -> Option<usize> {
        self.anchor.as_ref().map(|_| self.cursor)
    }
}

pub fn reanchor(previous: Option<&str>, order: &[&Record]) -> SelectionState {
    if let Some(hash) = previous {
        if let Some(index) = order.iter().position(|record| record.hash == hash) {
            return SelectionState {
                cursor: index,
                anchor: Some(hash.to_string()),
            };
        }
    }
    match order.first() {
        Some(first) => SelectionState {
            cursor: 0,
            anchor: Some(first.hash.clone()),
        },
        None => SelectionState::default(),
    }
}
