use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::model::Cell;

/// Capacity-bounded FIFO of rows evicted from the visible grid. Rows are
/// normalized to the grid's column count on append and on resize; the
/// eviction counter backs the combined-buffer base offset and only grows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scrollback {
    rows: VecDeque<Vec<Cell>>,
    capacity: usize,
    evicted: u64,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Scrollback {
            rows: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows dropped from the front since the session began.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn push(&mut self, mut row: Vec<Cell>, cols: u16) {
        normalize_row(&mut row, cols);
        if self.capacity == 0 {
            self.evicted += 1;
            return;
        }
        if self.rows.len() == self.capacity {
            self.rows.pop_front();
            self.evicted += 1;
        }
        self.rows.push_back(row);
    }

    pub fn row(&self, index: usize) -> Option<&[Cell]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn row_text(&self, index: usize) -> Option<String> {
        self.row(index)
            .map(|cells| cells.iter().map(|cell| cell.glyph.as_str()).collect())
    }

    /// Re-normalizes every stored row after a grid resize.
    pub fn set_cols(&mut self, cols: u16) {
        for row in &mut self.rows {
            normalize_row(row, cols);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &[Cell]> {
        self.rows.iter().map(Vec::as_slice)
    }
}

fn normalize_row(row: &mut Vec<Cell>, cols: u16) {
    let cols = cols.max(1) as usize;
    row.truncate(cols);
    while row.len() < cols {
        row.push(Cell::default());
    }
}
