use std::sync::Arc;

use crate::gather::GatherList;
use crate::tag::COLOR_MASK;

/// No run of free slots long enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// Pagepod slot table.
///
/// Every slot of a registration's run holds a reference to the same
/// [`GatherList`], so "slot occupied" and "slot has an entry" are the same
/// fact. Searches are next-fit from the last successful allocation.
///
/// Not synchronized; the manager keeps it behind its lock.
pub struct SlotMap {
    entries: Vec<Option<Arc<GatherList>>>,
    colors: Vec<u8>,
    /// Start of the last successful allocation, `nppods` before the first.
    idx_last: usize,
}

impl SlotMap {
    /// Create a table with `nppods` free slots.
    pub fn new(nppods: usize) -> Self {
        SlotMap {
            entries: vec![None; nppods],
            colors: vec![0; nppods],
            idx_last: nppods,
        }
    }

    pub fn nppods(&self) -> usize {
        self.entries.len()
    }

    pub fn idx_last(&self) -> usize {
        self.idx_last
    }

    /// First index `i` in `[start, limit - count]` with `count` free slots
    /// starting at `i`.
    pub fn find_free_run(&self, start: usize, limit: usize, count: usize) -> Result<usize, Busy> {
        let limit = limit.min(self.entries.len());
        let mut i = start;
        while i + count <= limit {
            match self.entries[i..i + count].iter().rposition(Option::is_some) {
                None => return Ok(i),
                // Nothing starting at or before the occupied slot can fit.
                Some(j) => i += j + 1,
            }
        }
        Err(Busy)
    }

    /// Next-fit search for `count` free slots.
    ///
    /// Searches past the last allocation first. Only when that fails and the
    /// last allocation sits at least `count` slots into the table does it
    /// wrap to 0, scanning up to `idx_last + count`.
    pub fn find_next_fit(&self, count: usize) -> Result<usize, Busy> {
        let nppods = self.entries.len();
        if count == 0 || count > nppods {
            return Err(Busy);
        }
        if self.idx_last == nppods {
            return self.find_free_run(0, nppods, count);
        }
        match self.find_free_run(self.idx_last + 1, nppods, count) {
            Ok(idx) => Ok(idx),
            Err(Busy) if self.idx_last >= count => {
                self.find_free_run(0, (self.idx_last + count).min(nppods), count)
            }
            Err(Busy) => Err(Busy),
        }
    }

    /// Record `gl` in `count` slots from `idx`.
    pub fn mark(&mut self, idx: usize, count: usize, gl: &Arc<GatherList>) {
        for entry in &mut self.entries[idx..idx + count] {
            debug_assert!(entry.is_none(), "marking an occupied slot");
            *entry = Some(gl.clone());
        }
    }

    /// Free `count` slots from `idx`, returning the registration they held.
    pub fn unmark(&mut self, idx: usize, count: usize) -> Option<Arc<GatherList>> {
        let mut held = None;
        for entry in &mut self.entries[idx..idx + count] {
            let gl = entry.take();
            if held.is_none() {
                held = gl;
            }
        }
        held
    }

    /// Bump and return the color for the slot at `idx`.
    pub fn next_color(&mut self, idx: usize) -> u8 {
        let color = (self.colors[idx] as u32 + 1) & COLOR_MASK;
        self.colors[idx] = color as u8;
        color as u8
    }

    pub fn set_last(&mut self, idx: usize) {
        self.idx_last = idx;
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<GatherList>> {
        self.entries.get(idx)?.as_ref()
    }

    /// Number of occupied slots.
    pub fn in_use(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Check that every occupied slot lies inside the run of the registration
    /// it holds, and every run is fully occupied by that registration.
    /// `start_of` maps a registration to the first slot of its run.
    pub fn is_consistent(&self, start_of: impl Fn(&GatherList) -> usize) -> bool {
        self.entries.iter().enumerate().all(|(i, entry)| {
            let Some(gl) = entry else {
                return true;
            };
            let start = start_of(gl.as_ref());
            let end = start + gl.pod_count();
            (start..end).contains(&i)
                && end <= self.entries.len()
                && self.entries[start..end]
                    .iter()
                    .all(|e| e.as_ref().is_some_and(|other| Arc::ptr_eq(other, gl)))
        })
    }
}
