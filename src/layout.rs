//! Device-side memory layout: permissioned blocks and the DfuSe
//! memory-map descriptor string.
//!
//! DfuSe devices describe each alternate setting's memory map in the
//! interface string, e.g. `@Internal Flash /0x08000000/16*001Ka,112*001Kg`.
//! [`parse_layout`] turns that into a [`NamedLayout`] of contiguous
//! [`Block`]s. Layouts are device-owned metadata and are re-parsed every time
//! an alternate setting is selected.

use std::cmp::Ordering;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Per-block access permissions, the low three bits of the trailing
    /// letter in the layout string (`a`..=`g`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const READABLE = 1 << 0;
        const WRITEABLE = 1 << 1;
        const ERASEABLE = 1 << 2;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("block at {got:#X} breaks layout contiguity, expected {expected:#X}")]
    Inconsistent { expected: u64, got: u64 },

    #[error("malformed memory layout string: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start_address: u64,
    pub size: u32,
    pub permissions: Permissions,
}

impl Block {
    pub fn new(start_address: u64, size: u32, permissions: Permissions) -> Self {
        debug_assert!(size > 0, "zero-sized block");
        Self {
            start_address,
            size,
            permissions,
        }
    }

    pub fn end_address(&self) -> u64 {
        self.start_address + self.size as u64 - 1
    }

    pub fn overlaps(&self, other: &Block) -> bool {
        self.start_address < other.start_address + other.size as u64
            && other.start_address < self.start_address + self.size as u64
    }
}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_address.cmp(&other.start_address)
    }
}

/// Ordered, gap-free sequence of blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    blocks: Vec<Block>,
}

impl Layout {
    pub fn new() -> Self {
        Self { blocks: vec![] }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append a block. The first block fixes the start address; every later
    /// one must begin exactly where its predecessor ends.
    pub fn append(&mut self, block: Block) -> Result<(), LayoutError> {
        if let Some(last) = self.blocks.last() {
            let expected = last.start_address + last.size as u64;
            if block.start_address != expected {
                return Err(LayoutError::Inconsistent {
                    expected,
                    got: block.start_address,
                });
            }
        }
        self.blocks.push(block);
        Ok(())
    }

    pub fn start_address(&self) -> Option<u64> {
        self.blocks.first().map(|b| b.start_address)
    }

    pub fn end_address(&self) -> Option<u64> {
        self.blocks.last().map(|b| b.end_address())
    }

    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }

    /// True when the inclusive address range lies entirely inside the layout.
    pub fn covers(&self, first: u64, last: u64) -> bool {
        match (self.start_address(), self.end_address()) {
            (Some(start), Some(end)) => first >= start && last <= end,
            _ => false,
        }
    }

    /// The contiguous run of blocks touching the inclusive address range.
    pub fn blocks_covering(&self, first: u64, last: u64) -> &[Block] {
        let lo = self.blocks.partition_point(|b| b.end_address() < first);
        let hi = self.blocks.partition_point(|b| b.start_address <= last);
        &self.blocks[lo..hi]
    }
}

/// A layout carrying its DfuSe target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedLayout {
    pub name: String,
    pub layout: Layout,
}

/// Parse a DfuSe alternate-setting string into a [`NamedLayout`].
///
/// Grammar: `@<name> /0x<hex-addr>/<n>*<size><unit><perm>[,...]` where
/// `<unit>` is a space (bytes), `K`, or `M`, and `<perm>` is a letter whose
/// low three bits are the [`Permissions`].
pub fn parse_layout(descriptor: &str) -> Result<NamedLayout, LayoutError> {
    let malformed = |detail: &str| LayoutError::Malformed(detail.to_string());

    let rest = descriptor
        .strip_prefix('@')
        .ok_or_else(|| malformed("missing leading '@'"))?;
    let (name, rest) = rest
        .split_once('/')
        .ok_or_else(|| malformed("missing address section"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(malformed("empty target name"));
    }

    let (addr, blocks_str) = rest
        .split_once('/')
        .ok_or_else(|| malformed("missing block list"))?;
    let addr = addr.trim();
    let addr = addr
        .strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .ok_or_else(|| malformed("address must be hexadecimal"))?;
    let mut address =
        u64::from_str_radix(addr, 16).map_err(|_| malformed("invalid hexadecimal address"))?;

    let mut layout = Layout::new();
    for group in blocks_str.split(',') {
        let (count, sized) = group
            .split_once('*')
            .ok_or_else(|| malformed("block group missing '*'"))?;
        let count: u32 = count
            .trim()
            .parse()
            .map_err(|_| malformed("invalid block count"))?;
        if count == 0 {
            return Err(malformed("zero block count"));
        }

        let digits_end = sized
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| malformed("block group missing unit and permissions"))?;
        let size: u32 = sized[..digits_end]
            .parse()
            .map_err(|_| malformed("invalid block size"))?;

        let mut tail = sized[digits_end..].chars();
        let unit = tail.next().ok_or_else(|| malformed("missing size unit"))?;
        let multiplier = match unit {
            ' ' => 1,
            'K' => 1024,
            'M' => 1024 * 1024,
            _ => return Err(malformed("size unit must be ' ', 'K' or 'M'")),
        };
        let perm = tail
            .next()
            .ok_or_else(|| malformed("missing permission letter"))?;
        if tail.next().is_some() {
            return Err(malformed("trailing characters after permission letter"));
        }
        if !perm.is_ascii_alphabetic() {
            return Err(malformed("permission must be a letter"));
        }
        let permissions = Permissions::from_bits_truncate(perm as u8 & 0x07);

        let size = size
            .checked_mul(multiplier)
            .ok_or_else(|| malformed("block size overflows"))?;
        if size == 0 {
            return Err(malformed("zero block size"));
        }

        for _ in 0..count {
            layout.append(Block::new(address, size, permissions))?;
            address += size as u64;
        }
    }

    if layout.is_empty() {
        return Err(malformed("empty block list"));
    }

    Ok(NamedLayout {
        name: name.to_string(),
        layout,
    })
}
