use std::fmt;
use std::io;

const WORD_BITS: usize = u64::BITS as usize;

/// Error libnuma reports when a mask cannot hold a CPU or node id
pub fn range_error() -> io::Error {
    io::Error::from_raw_os_error(libc::ERANGE)
}

pub fn is_range_error(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ERANGE)
}

/// Fixed-capacity set of CPU or node ids
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmask {
    words: Vec<u64>,
    capacity: usize,
}

impl Bitmask {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            capacity,
        }
    }

    /// Parse a kernel list such as `0-3,8,10-11`
    pub fn parse_list(list: &str, capacity: usize) -> io::Result<Self> {
        let mut mask = Self::new(capacity);
        let list = list.trim();
        if list.is_empty() {
            return Ok(mask);
        }

        for part in list.split(',') {
            let part = part.trim();
            let (start, end) = match part.split_once('-') {
                Some((a, b)) => (parse_id(a)?, parse_id(b)?),
                None => {
                    let id = parse_id(part)?;
                    (id, id)
                }
            };
            if start > end {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("descending range {part:?}"),
                ));
            }
            for bit in start..=end {
                mask.set(bit)?;
            }
        }
        Ok(mask)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of set bits
    pub fn weight(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.weight() == 0
    }

    pub fn is_set(&self, bit: u32) -> bool {
        let bit = bit as usize;
        bit < self.capacity && self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Set `bit`, failing with `ERANGE` past the capacity
    pub fn set(&mut self, bit: u32) -> io::Result<()> {
        let bit = bit as usize;
        if bit >= self.capacity {
            return Err(range_error());
        }
        self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        Ok(())
    }

    pub fn clear(&mut self, bit: u32) {
        let bit = bit as usize;
        if bit < self.capacity {
            self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        }
    }

    /// Set bits in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.capacity)
            .map(|b| b as u32)
            .filter(move |&b| self.is_set(b))
    }

    /// Bits set in both masks, sized like `self`
    pub fn intersect(&self, other: &Bitmask) -> Bitmask {
        let mut out = Bitmask::new(self.capacity);
        for (i, word) in out.words.iter_mut().enumerate() {
            *word = self.words[i] & other.words.get(i).copied().unwrap_or(0);
        }
        out
    }

    pub fn max(&self) -> Option<u32> {
        self.iter().last()
    }
}

fn parse_id(s: &str) -> io::Result<u32> {
    s.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("invalid id {s:?}")))
}

impl fmt::Display for Bitmask {
    /// Formats in kernel list syntax
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut bits = self.iter().peekable();
        while let Some(start) = bits.next() {
            let mut end = start;
            while bits.peek() == Some(&(end + 1)) {
                end += 1;
                bits.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmask({}/{})", self, self.capacity)
    }
}
