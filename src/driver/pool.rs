//! Fixed pool of log buffers.
//!
//! Slot states live in an array indexed by slot number; free slots are kept
//! on an index free-list, so acquiring a buffer never scans or allocates.
//! The memory of a Pending or Ready slot travels inside its [`LogBuffer`]
//! token, which makes the token's holder the buffer's only owner.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Pending,
    Ready,
}

/// Ownership token for one slot. Not `Clone`.
#[derive(Debug)]
pub struct LogBuffer {
    slot: usize,
    data: Vec<u8>,
    len: usize,
}

impl LogBuffer {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Bytes written by the last completed read.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole capacity, for the device to read into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub free: usize,
    pub pending: usize,
    pub ready: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.free + self.pending + self.ready
    }
}

pub struct BufferPool {
    states: Vec<BufferState>,
    parked: Vec<Option<Vec<u8>>>,
    free: Vec<usize>,
}

impl BufferPool {
    pub fn new(count: usize, size: usize) -> Self {
        Self {
            states: vec![BufferState::Free; count],
            parked: (0..count).map(|_| Some(vec![0u8; size])).collect(),
            // Reversed so slot 0 is handed out first.
            free: (0..count).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// Takes a free slot into Pending. `None` when every slot is in flight.
    pub fn acquire(&mut self) -> Option<LogBuffer> {
        let slot = self.free.pop()?;
        let data = self.parked[slot].take()?;
        self.states[slot] = BufferState::Pending;
        Some(LogBuffer { slot, data, len: 0 })
    }

    /// Pending -> Ready. Returns false (and changes nothing) for any other state.
    pub fn mark_ready(&mut self, buf: &LogBuffer) -> bool {
        match self.states.get(buf.slot) {
            Some(BufferState::Pending) => {
                self.states[buf.slot] = BufferState::Ready;
                true
            }
            _ => false,
        }
    }

    /// Pending or Ready -> Free.
    pub fn release(&mut self, mut buf: LogBuffer) {
        let slot = buf.slot;
        if self.states.get(slot).map_or(true, |s| *s == BufferState::Free) {
            tracing::error!("Buffer slot {slot} released twice or out of range");
            return;
        }
        buf.len = 0;
        self.states[slot] = BufferState::Free;
        self.parked[slot] = Some(buf.data);
        self.free.push(slot);
    }

    pub fn state(&self, slot: usize) -> Option<BufferState> {
        self.states.get(slot).copied()
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for state in &self.states {
            match state {
                BufferState::Free => counts.free += 1,
                BufferState::Pending => counts.pending += 1,
                BufferState::Ready => counts.ready += 1,
            }
        }
        counts
    }
}
