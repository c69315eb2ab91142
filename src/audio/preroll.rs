use std::collections::TryReserveError;
use std::collections::VecDeque;

/// Audio kept from just before speech onset
pub const PREROLL_MS: u32 = 800;

/// Rolling buffer of the most recent silent audio.
///
/// Holds at most `capacity` samples; the oldest samples are evicted first.
/// Flushed into the encoder when voice is detected so speech onsets are not
/// clipped.
#[derive(Debug)]
pub struct PreRollBuffer {
    samples: VecDeque<i16>,
    capacity: usize,
}

impl PreRollBuffer {
    /// Reserve a buffer holding `PREROLL_MS` of audio at `sample_rate`
    pub fn for_rate(sample_rate: u32) -> Result<Self, TryReserveError> {
        let capacity = (u64::from(sample_rate) * u64::from(PREROLL_MS) / 1000) as usize;
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut samples = VecDeque::new();
        samples.try_reserve_exact(capacity)?;
        Ok(Self { samples, capacity })
    }

    /// Append samples, evicting the oldest beyond capacity
    pub fn extend(&mut self, frame: &[i16]) {
        if self.capacity == 0 {
            return;
        }
        let frame = if frame.len() > self.capacity {
            &frame[frame.len() - self.capacity..]
        } else {
            frame
        };

        let overflow = (self.samples.len() + frame.len()).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(frame.iter().copied());
    }

    /// Take everything buffered, oldest first
    pub fn take(&mut self) -> Vec<i16> {
        self.samples.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_samples() {
        let mut buffer = PreRollBuffer::with_capacity(4).unwrap();
        buffer.extend(&[1, 2, 3]);
        buffer.extend(&[4, 5]);
        assert_eq!(buffer.take(), vec![2, 3, 4, 5]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn oversized_frame_keeps_tail() {
        let mut buffer = PreRollBuffer::with_capacity(3).unwrap();
        buffer.extend(&[1, 2, 3, 4, 5]);
        assert_eq!(buffer.take(), vec![3, 4, 5]);
    }

    #[test]
    fn capacity_matches_duration() {
        let buffer = PreRollBuffer::for_rate(16000).unwrap();
        assert_eq!(buffer.capacity(), 12800);
    }
}
