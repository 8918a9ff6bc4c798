//! Grouping of pinned entries into batched scatter reads.
//!
//! A coalesced load pins a set of entries that sit close together in a file.
//! [`read_pins`] turns that set into as few reads as possible: neighbors
//! separated by at most `max_gap` bytes are merged into one read, with the
//! gap carried as an explicit skip range so the read still covers one
//! contiguous file window.

use std::ops::Range;

use crate::{
    cache::{entry::EntryData, pin::ExclusivePin},
    Result,
};

/// Volume accounting for one `read_pins` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceIoStats {
    /// Bytes landing in entry buffers.
    pub payload_bytes: u64,
    /// Bytes read and discarded to bridge gaps between entries.
    pub gap_bytes: u64,
    /// Number of scatter reads issued.
    pub num_ios: u64,
}

/// One range of a scatter read: either a destination buffer or a stretch of
/// the file to read and discard.
#[derive(Debug)]
pub enum IoRange<'a> {
    Data(&'a mut [u8]),
    Gap(usize),
}

impl IoRange<'_> {
    pub fn len(&self) -> usize {
        match self {
            IoRange::Data(bytes) => bytes.len(),
            IoRange::Gap(size) => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read into `pins`, which must be sorted by file offset, using at most
/// `ranges_per_io` ranges per read and merging entries separated by at most
/// `max_gap` bytes.
///
/// `offset_of` maps a pin index to its file offset. `read` is invoked once
/// per batch with the pin index range, the batch's starting file offset and
/// the scatter ranges (entry buffers interleaved with gaps); it must fill
/// every `Data` range completely. Tiny entries contribute one range, paged
/// entries one range per run of their allocation.
pub fn read_pins<OffsetFn, ReadFn>(
    pins: &mut [ExclusivePin],
    max_gap: u64,
    ranges_per_io: usize,
    mut offset_of: OffsetFn,
    mut read: ReadFn,
) -> Result<CoalesceIoStats>
where
    OffsetFn: FnMut(usize) -> u64,
    ReadFn: FnMut(Range<usize>, u64, &mut [IoRange<'_>]) -> Result<()>,
{
    let mut stats = CoalesceIoStats::default();
    if pins.is_empty() {
        return Ok(stats);
    }
    assert!(ranges_per_io > 0, "need at least one range per read");

    // Plan the batch boundaries first; the buffer walk below splits the pin
    // slice at them.
    let mut boundaries = Vec::new();
    let mut num_ranges = range_count(&pins[0]);
    let mut prev_end = offset_of(0) + pins[0].size() as u64;
    for index in 1..pins.len() {
        let offset = offset_of(index);
        assert!(offset >= prev_end, "pins must be sorted and disjoint");
        let gap = offset - prev_end;
        let gap_ranges = usize::from(gap > 0);
        let entry_ranges = range_count(&pins[index]);
        if gap > max_gap || num_ranges + gap_ranges + entry_ranges > ranges_per_io {
            boundaries.push(index);
            num_ranges = entry_ranges;
        } else {
            num_ranges += gap_ranges + entry_ranges;
            stats.gap_bytes += gap;
        }
        prev_end = offset + pins[index].size() as u64;
    }
    boundaries.push(pins.len());

    let mut rest = pins;
    let mut begin = 0;
    for end in boundaries {
        let taken = std::mem::take(&mut rest);
        let (batch, tail) = taken.split_at_mut(end - begin);
        rest = tail;

        let start_offset = offset_of(begin);
        let mut cursor = start_offset;
        let mut ranges: Vec<IoRange<'_>> = Vec::new();
        for (i, pin) in batch.iter_mut().enumerate() {
            let offset = offset_of(begin + i);
            if offset > cursor {
                ranges.push(IoRange::Gap((offset - cursor) as usize));
            }
            let size = pin.size();
            stats.payload_bytes += size as u64;
            match pin.data_mut() {
                EntryData::Tiny(bytes) => ranges.push(IoRange::Data(&mut bytes[..size])),
                EntryData::Pages(allocation) => {
                    let mut remaining = size;
                    for run in allocation.runs_mut() {
                        if remaining == 0 {
                            break;
                        }
                        let take = remaining.min(run.len());
                        ranges.push(IoRange::Data(&mut run[..take]));
                        remaining -= take;
                    }
                    assert_eq!(remaining, 0, "entry storage smaller than its size");
                }
                EntryData::Empty => panic!("cannot read into an entry without storage"),
            }
            cursor = offset + size as u64;
        }
        read(begin..end, start_offset, &mut ranges)?;
        stats.num_ios += 1;
        begin = end;
    }
    Ok(stats)
}

fn range_count(pin: &ExclusivePin) -> usize {
    match pin.data() {
        EntryData::Pages(allocation) => allocation.num_runs().max(1),
        _ => 1,
    }
}
