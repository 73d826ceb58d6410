//! Header scheduler
//!
//! Frame headers and side information are rendered before the main data
//! that physically precedes them has been written. Each rendered block is
//! queued with the absolute bit offset (`write_timing`) at which it belongs,
//! and the bit writer splices it in when its cursor reaches that offset.

use std::collections::VecDeque;

use log::error;

use crate::error::{EncodingError, EncodingResult};

/// Ring capacity; larger than the number of frames the reservoir can span
pub const MAX_HEADER_BUF: usize = 256;

/// Largest rendered header plus side information, CRC included
pub const MAX_HEADER_LEN: usize = 40;

/// One rendered header and side-info block awaiting its splice point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledHeader {
    buf: [u8; MAX_HEADER_LEN],
    len: usize,
    write_timing: u64,
}

impl ScheduledHeader {
    /// Wrap rendered bytes; `bytes` must not exceed `MAX_HEADER_LEN`
    pub fn new(bytes: &[u8], write_timing: u64) -> Self {
        let len = bytes.len().min(MAX_HEADER_LEN);
        let mut buf = [0u8; MAX_HEADER_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            buf,
            len,
            write_timing,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Size of the block in bits
    pub fn bits(&self) -> u64 {
        8 * self.len as u64
    }

    pub fn write_timing(&self) -> u64 {
        self.write_timing
    }
}

/// Fixed-capacity queue of headers ordered by `write_timing`
#[derive(Debug)]
pub struct HeaderScheduler {
    queue: VecDeque<ScheduledHeader>,
    capacity: usize,
    next_write_timing: u64,
    last_write_timing: Option<u64>,
}

impl HeaderScheduler {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HEADER_BUF)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            next_write_timing: 0,
            last_write_timing: None,
        }
    }

    /// Bit offset assigned to the next scheduled header
    pub fn next_write_timing(&self) -> u64 {
        self.next_write_timing
    }

    /// Bit offset of the most recently scheduled header
    pub fn last_write_timing(&self) -> Option<u64> {
        self.last_write_timing
    }

    /// Headers rendered but not yet spliced
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Total size of the pending headers in bits
    pub fn pending_bits(&self) -> u64 {
        self.queue.iter().map(ScheduledHeader::bits).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue `header`, which must carry the next write timing, and move the
    /// next timing forward by one frame
    pub fn try_push(&mut self, header: ScheduledHeader, bits_per_frame: usize) -> EncodingResult<()> {
        if self.queue.len() == self.capacity {
            error!("header ring full with {} pending headers", self.capacity);
            return Err(EncodingError::HeaderRingOverflow {
                capacity: self.capacity,
            });
        }
        if header.write_timing != self.next_write_timing {
            error!(
                "header scheduled at bit {} but the next slot is at bit {}",
                header.write_timing, self.next_write_timing
            );
            return Err(EncodingError::HeaderTimingMissed {
                write_timing: header.write_timing,
                position: self.next_write_timing,
            });
        }
        self.last_write_timing = Some(header.write_timing);
        self.next_write_timing = header.write_timing + bits_per_frame as u64;
        self.queue.push_back(header);
        Ok(())
    }

    /// Render-and-queue convenience: schedules `bytes` at the next timing
    /// and returns that timing
    pub fn schedule(&mut self, bytes: &[u8], bits_per_frame: usize) -> EncodingResult<u64> {
        let write_timing = self.next_write_timing;
        self.try_push(ScheduledHeader::new(bytes, write_timing), bits_per_frame)?;
        Ok(write_timing)
    }

    /// Remove the front header if it is due at `position`
    ///
    /// A front header whose timing lies behind `position` was skipped over
    /// and can no longer be placed correctly.
    pub fn pop_front_if_due(&mut self, position: u64) -> EncodingResult<Option<ScheduledHeader>> {
        match self.queue.front() {
            Some(front) if front.write_timing == position => Ok(self.queue.pop_front()),
            Some(front) if front.write_timing < position => {
                error!(
                    "header due at bit {} missed, writer already at bit {}",
                    front.write_timing, position
                );
                Err(EncodingError::HeaderTimingMissed {
                    write_timing: front.write_timing,
                    position,
                })
            }
            _ => Ok(None),
        }
    }
}

impl Default for HeaderScheduler {
    fn default() -> Self {
        Self::new()
    }
}
