//! Frame placement policy for the user pool.

use super::CoreMapEntry;
use core::ops::Range;

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Default {
    /// Returns a range indicating the frame numbers to be allocated, or [`None`] if a
    /// sufficiently large range of free frames cannot be found.
    fn place(&mut self, core_map: &[CoreMapEntry], frames_requested: usize)
        -> Option<Range<usize>>;
}

#[derive(Debug, Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

impl PlacementAlgorithm for NextFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        let total_frames = core_map.len();
        if frames_requested == 0 || frames_requested > total_frames {
            return None;
        }

        let mut block_start_ind = self.position;
        let mut wrapped_around = false;

        while !(wrapped_around && block_start_ind >= self.position) {
            if block_start_ind + frames_requested > total_frames {
                // A second wrap would loop forever on requests that can never fit.
                if wrapped_around {
                    break;
                }
                block_start_ind = 0;
                wrapped_around = true;
                continue;
            }

            let mut block_size = 0;
            while block_size < frames_requested
                && !core_map[block_start_ind + block_size].allocated()
            {
                block_size += 1;
            }

            if block_size == frames_requested {
                self.position = (block_start_ind + block_size) % total_frames;
                return Some(block_start_ind..(block_start_ind + block_size));
            }
            // Skip past the allocated frame that cut the block short.
            block_start_ind += block_size + 1;
        }

        None
    }
}
