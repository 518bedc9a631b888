//! Compact bitmap for per-replica boolean flags.

use std::fmt;

use crate::utils::PaxkvError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for u8 ID -> bool mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u8, ones: bool) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        let mut bits = FixedBitSet::with_capacity(size as usize);
        if ones {
            bits.set_range(.., true);
        }
        Bitmap(bits)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), PaxkvError> {
        if idx as usize >= self.0.len() {
            return Err(PaxkvError(format!("index {} out of bound", idx)));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, PaxkvError> {
        if idx as usize >= self.0.len() {
            return Err(PaxkvError(format!("index {} out of bound", idx)));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        (0..self.size()).map(|id| (id, self.0[id as usize]))
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first = true;
        for (i, flag) in self.iter() {
            if !flag {
                continue;
            }
            if first {
                write!(f, "{}", i)?;
                first = false;
            } else {
                write!(f, ", {}", i)?;
            }
        }
        write!(f, "]}}")
    }
}
