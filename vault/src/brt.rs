//! Block-ref tables: a compact per-relation index of modified blocks, the
//! backbone of incremental backups.
//!
//! Blocks of a relation fork are grouped into chunks of [`BLOCKS_PER_CHUNK`].
//! A chunk starts out as a small sorted-insertion array of 16-bit offsets
//! and flips to a bitmap once it would reach [`MAX_ENTRIES_PER_CHUNK`] - 1
//! entries. `limit_block` caps the relation length; lowering it drops every
//! reference above the new limit.
//!
//! The serialized form is a magic word, entries sorted by (tablespace,
//! database, relnumber, fork) with trailing empty chunks trimmed, and an
//! all-zero sentinel entry at the end.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use postgres_ffi::{BlockNumber, RelFileLocator};

pub const BLOCKREFTABLE_MAGIC: u32 = 0x652b137b;

pub const BLOCKS_PER_CHUNK: u32 = 1 << 16;
pub const BLOCKS_PER_ENTRY: u32 = 16;
pub const MAX_ENTRIES_PER_CHUNK: u16 = (BLOCKS_PER_CHUNK / BLOCKS_PER_ENTRY) as u16;
pub const INITIAL_ENTRIES_PER_CHUNK: usize = 16;

pub const INVALID_BLOCK_NUMBER: BlockNumber = 0xFFFF_FFFF;

/// Size of the reader's refill buffer.
const READ_BUFFER_SIZE: usize = 4096;
/// How many blocks one `get_blocks` call returns at most.
pub const BLOCKS_PER_READ: usize = 512;

const SERIALIZED_ENTRY_SIZE: usize = 12 + 4 + 4 + 4;

#[derive(Debug, thiserror::Error)]
pub enum BrtError {
    #[error("corrupt block-ref table: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-(relation, fork) state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrtEntry {
    pub limit_block: BlockNumber,
    max_block_number: BlockNumber,
    /// Number of valid entries per chunk; MAX_ENTRIES_PER_CHUNK marks a
    /// bitmap chunk.
    chunk_usage: Vec<u16>,
    chunk_data: Vec<Vec<u16>>,
}

impl BrtEntry {
    fn new(limit_block: BlockNumber) -> BrtEntry {
        BrtEntry {
            limit_block,
            max_block_number: INVALID_BLOCK_NUMBER,
            chunk_usage: Vec::new(),
            chunk_data: Vec::new(),
        }
    }

    fn nchunks(&self) -> usize {
        self.chunk_usage.len()
    }

    fn is_bitmap(&self, chunkno: usize) -> bool {
        self.chunk_usage[chunkno] == MAX_ENTRIES_PER_CHUNK
    }

    fn mark_block_modified(&mut self, blkno: BlockNumber) {
        if self.max_block_number == INVALID_BLOCK_NUMBER {
            self.max_block_number = blkno;
        } else {
            self.max_block_number = self.max_block_number.max(blkno);
        }

        let chunkno = (blkno / BLOCKS_PER_CHUNK) as usize;
        let chunkoffset = (blkno % BLOCKS_PER_CHUNK) as u16;

        // Enlarge the chunk arrays to a power of two, at least 16, big
        // enough for chunkno to be a valid index.
        if chunkno >= self.nchunks() {
            let mut max_chunks = std::cmp::max(16, self.nchunks());
            while max_chunks < chunkno + 1 {
                max_chunks *= 2;
            }
            self.chunk_usage.resize(max_chunks, 0);
            self.chunk_data.resize(max_chunks, Vec::new());
        }

        let usage = self.chunk_usage[chunkno];
        let chunk = &mut self.chunk_data[chunkno];

        if usage == 0 {
            chunk.reserve(INITIAL_ENTRIES_PER_CHUNK);
            chunk.push(chunkoffset);
            self.chunk_usage[chunkno] = 1;
            return;
        }

        if usage == MAX_ENTRIES_PER_CHUNK {
            // bitmap: set the bit
            chunk[(chunkoffset / BLOCKS_PER_ENTRY as u16) as usize] |=
                1 << (chunkoffset % BLOCKS_PER_ENTRY as u16);
            return;
        }

        // array: a duplicate needs no work
        if chunk.iter().any(|&off| off == chunkoffset) {
            return;
        }

        if usage == MAX_ENTRIES_PER_CHUNK - 1 {
            // time to convert to bitmap format
            let mut bitmap = vec![0u16; MAX_ENTRIES_PER_CHUNK as usize];
            for &off in chunk.iter() {
                bitmap[(off / BLOCKS_PER_ENTRY as u16) as usize] |=
                    1 << (off % BLOCKS_PER_ENTRY as u16);
            }
            bitmap[(chunkoffset / BLOCKS_PER_ENTRY as u16) as usize] |=
                1 << (chunkoffset % BLOCKS_PER_ENTRY as u16);
            *chunk = bitmap;
            self.chunk_usage[chunkno] = MAX_ENTRIES_PER_CHUNK;
            return;
        }

        chunk.push(chunkoffset);
        self.chunk_usage[chunkno] = usage + 1;
    }

    fn set_limit_block(&mut self, limit_block: BlockNumber) {
        // only lowering the limit discards anything
        if self.limit_block <= limit_block {
            return;
        }
        self.limit_block = limit_block;

        let limit_chunkno = (limit_block / BLOCKS_PER_CHUNK) as usize;
        let limit_chunkoffset = (limit_block % BLOCKS_PER_CHUNK) as u16;

        if limit_chunkno >= self.nchunks() {
            return;
        }

        // Discard entire contents of any higher-numbered chunks.
        for chunkno in limit_chunkno + 1..self.nchunks() {
            self.chunk_usage[chunkno] = 0;
            self.chunk_data[chunkno].clear();
        }

        if self.is_bitmap(limit_chunkno) {
            let chunk = &mut self.chunk_data[limit_chunkno];
            for chunkoffset in limit_chunkoffset as u32..BLOCKS_PER_CHUNK {
                chunk[(chunkoffset / BLOCKS_PER_ENTRY) as usize] &=
                    !(1 << (chunkoffset % BLOCKS_PER_ENTRY));
            }
        } else {
            // offset array: filter out large offsets
            let chunk = &mut self.chunk_data[limit_chunkno];
            chunk.retain(|&off| off < limit_chunkoffset);
            self.chunk_usage[limit_chunkno] = chunk.len() as u16;
        }
    }

    /// Modified blocks in `[start_blkno, stop_blkno)`, ascending.
    pub fn blocks_in_range(
        &self,
        start_blkno: BlockNumber,
        stop_blkno: BlockNumber,
    ) -> Vec<BlockNumber> {
        let mut blocks = Vec::new();
        let start_chunkno = (start_blkno / BLOCKS_PER_CHUNK) as usize;
        let mut stop_chunkno = (stop_blkno / BLOCKS_PER_CHUNK) as usize;
        if stop_blkno % BLOCKS_PER_CHUNK != 0 {
            stop_chunkno += 1;
        }
        let stop_chunkno = stop_chunkno.min(self.nchunks());

        for chunkno in start_chunkno..stop_chunkno {
            let start_offset = if chunkno == start_chunkno {
                (start_blkno % BLOCKS_PER_CHUNK) as u16
            } else {
                0
            };
            let stop_offset = if chunkno + 1 == stop_chunkno
                && (stop_blkno as u64) < ((chunkno as u64 + 1) * BLOCKS_PER_CHUNK as u64)
            {
                (stop_blkno % BLOCKS_PER_CHUNK) as u32
            } else {
                BLOCKS_PER_CHUNK
            };

            if self.is_bitmap(chunkno) {
                let chunk = &self.chunk_data[chunkno];
                for i in start_offset as u32..stop_offset {
                    if chunk[(i / BLOCKS_PER_ENTRY) as usize] & (1 << (i % BLOCKS_PER_ENTRY)) != 0
                    {
                        blocks.push(chunkno as u32 * BLOCKS_PER_CHUNK + i);
                    }
                }
            } else {
                let mut offsets: Vec<u16> = self.chunk_data[chunkno]
                    [..self.chunk_usage[chunkno] as usize]
                    .iter()
                    .copied()
                    .filter(|&off| off as u32 >= start_offset as u32 && (off as u32) < stop_offset)
                    .collect();
                offsets.sort_unstable();
                blocks.extend(
                    offsets
                        .into_iter()
                        .map(|off| chunkno as u32 * BLOCKS_PER_CHUNK + off as u32),
                );
            }
        }
        blocks
    }
}

/// In-memory block-ref table: `(relation, fork) -> BrtEntry`. The map is
/// ordered, which gives the serialization its deterministic entry order for
/// free.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockRefTable {
    entries: BTreeMap<(RelFileLocator, u8), BrtEntry>,
}

impl BlockRefTable {
    pub fn new() -> BlockRefTable {
        BlockRefTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mark_block_modified(&mut self, rlocator: RelFileLocator, forknum: u8, blkno: BlockNumber) {
        self.entries
            .entry((rlocator, forknum))
            // Unbounded until the relation length is learned.
            .or_insert_with(|| BrtEntry::new(INVALID_BLOCK_NUMBER))
            .mark_block_modified(blkno);
    }

    pub fn set_limit_block(&mut self, rlocator: RelFileLocator, forknum: u8, limit_block: BlockNumber) {
        self.entries
            .entry((rlocator, forknum))
            .or_insert_with(|| BrtEntry::new(limit_block))
            .set_limit_block(limit_block);
    }

    pub fn get_entry(&self, rlocator: RelFileLocator, forknum: u8) -> Option<&BrtEntry> {
        self.entries.get(&(rlocator, forknum))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(RelFileLocator, u8), &BrtEntry)> {
        self.entries.iter()
    }

    /// Serialize: magic, sorted entries (trailing zero-usage chunks trimmed),
    /// the all-zero sentinel entry.
    pub fn write_to(&self, w: &mut impl Write) -> Result<(), BrtError> {
        w.write_all(&BLOCKREFTABLE_MAGIC.to_le_bytes())?;
        for ((rlocator, forknum), entry) in &self.entries {
            let mut nchunks = entry.nchunks();
            while nchunks > 0 && entry.chunk_usage[nchunks - 1] == 0 {
                nchunks -= 1;
            }
            write_serialized_entry(
                w,
                rlocator,
                *forknum as u32,
                entry.limit_block,
                nchunks as u32,
            )?;
            for &usage in &entry.chunk_usage[..nchunks] {
                w.write_all(&usage.to_le_bytes())?;
            }
            for chunkno in 0..nchunks {
                let usage = entry.chunk_usage[chunkno] as usize;
                if usage == 0 {
                    continue;
                }
                for &word in &entry.chunk_data[chunkno][..usage] {
                    w.write_all(&word.to_le_bytes())?;
                }
            }
        }
        // terminator
        w.write_all(&[0u8; SERIALIZED_ENTRY_SIZE])?;
        w.flush()?;
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<BlockRefTable, BrtError> {
        let mut table = BlockRefTable::new();
        let mut reader = BrtReader::new(r)?;
        while let Some((rlocator, forknum, limit_block)) = reader.next_relation()? {
            if limit_block != INVALID_BLOCK_NUMBER {
                table.set_limit_block(rlocator, forknum, limit_block);
            } else {
                // materialize the entry even if no blocks follow
                table
                    .entries
                    .entry((rlocator, forknum))
                    .or_insert_with(|| BrtEntry::new(INVALID_BLOCK_NUMBER));
            }
            let mut blocks = Vec::with_capacity(BLOCKS_PER_READ);
            loop {
                reader.get_blocks(&mut blocks)?;
                if blocks.is_empty() {
                    break;
                }
                for &blkno in &blocks {
                    table.mark_block_modified(rlocator, forknum, blkno);
                }
                blocks.clear();
            }
        }
        Ok(table)
    }

    pub fn write_file(&self, path: &camino::Utf8Path) -> Result<(), BrtError> {
        let mut file = std::fs::File::create(path)?;
        self.write_to(&mut file)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read_file(path: &camino::Utf8Path) -> Result<BlockRefTable, BrtError> {
        let mut file = std::fs::File::open(path)?;
        BlockRefTable::read_from(&mut file)
    }
}

fn write_serialized_entry(
    w: &mut impl Write,
    rlocator: &RelFileLocator,
    forknum: u32,
    limit_block: BlockNumber,
    nchunks: u32,
) -> std::io::Result<()> {
    w.write_all(&rlocator.spc_oid.to_le_bytes())?;
    w.write_all(&rlocator.db_oid.to_le_bytes())?;
    w.write_all(&rlocator.rel_number.to_le_bytes())?;
    w.write_all(&forknum.to_le_bytes())?;
    w.write_all(&limit_block.to_le_bytes())?;
    w.write_all(&nchunks.to_le_bytes())?;
    Ok(())
}

/// Streaming reader over a serialized block-ref table: call
/// [`next_relation`], then drain its blocks with repeated [`get_blocks`]
/// calls.
///
/// [`next_relation`]: BrtReader::next_relation
/// [`get_blocks`]: BrtReader::get_blocks
pub struct BrtReader<'a, R: Read> {
    inner: &'a mut R,
    buffer: [u8; READ_BUFFER_SIZE],
    used: usize,
    cursor: usize,
    chunk_sizes: Vec<u16>,
    total_chunks: usize,
    consumed_chunks: usize,
    chunk_position: u32,
    chunk_data: Vec<u16>,
}

impl<'a, R: Read> BrtReader<'a, R> {
    pub fn new(inner: &'a mut R) -> Result<BrtReader<'a, R>, BrtError> {
        let mut reader = BrtReader {
            inner,
            buffer: [0; READ_BUFFER_SIZE],
            used: 0,
            cursor: 0,
            chunk_sizes: Vec::new(),
            total_chunks: 0,
            consumed_chunks: 0,
            chunk_position: 0,
            chunk_data: Vec::new(),
        };
        let mut magic = [0u8; 4];
        reader.read_exact_buffered(&mut magic)?;
        let magic = u32::from_le_bytes(magic);
        if magic != BLOCKREFTABLE_MAGIC {
            return Err(BrtError::Corrupt(format!(
                "bad magic {magic:#010x}, expected {BLOCKREFTABLE_MAGIC:#010x}"
            )));
        }
        Ok(reader)
    }

    fn read_exact_buffered(&mut self, out: &mut [u8]) -> Result<(), BrtError> {
        let mut filled = 0;
        while filled < out.len() {
            if self.cursor < self.used {
                let n = std::cmp::min(out.len() - filled, self.used - self.cursor);
                out[filled..filled + n].copy_from_slice(&self.buffer[self.cursor..self.cursor + n]);
                self.cursor += n;
                filled += n;
            } else {
                self.used = self.inner.read(&mut self.buffer)?;
                self.cursor = 0;
                if self.used == 0 {
                    return Err(BrtError::Corrupt("unexpected end of file".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Advance to the next relation fork in the file. Returns None at the
    /// sentinel entry.
    pub fn next_relation(
        &mut self,
    ) -> Result<Option<(RelFileLocator, u8, BlockNumber)>, BrtError> {
        let mut entry = [0u8; SERIALIZED_ENTRY_SIZE];
        self.read_exact_buffered(&mut entry)?;
        if entry.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let word = |i: usize| u32::from_le_bytes(entry[i * 4..i * 4 + 4].try_into().unwrap());
        let rlocator = RelFileLocator {
            spc_oid: word(0),
            db_oid: word(1),
            rel_number: word(2),
        };
        let forknum = word(3) as u8;
        let limit_block = word(4);
        let nchunks = word(5) as usize;

        self.chunk_sizes = Vec::with_capacity(nchunks);
        for _ in 0..nchunks {
            let mut size = [0u8; 2];
            self.read_exact_buffered(&mut size)?;
            self.chunk_sizes.push(u16::from_le_bytes(size));
        }
        self.total_chunks = nchunks;
        self.consumed_chunks = 0;
        self.chunk_position = 0;
        self.chunk_data.clear();

        Ok(Some((rlocator, forknum, limit_block)))
    }

    /// Append up to [`BLOCKS_PER_READ`] block numbers of the current
    /// relation to `blocks`; an empty result means the relation is done.
    pub fn get_blocks(&mut self, blocks: &mut Vec<BlockNumber>) -> Result<(), BrtError> {
        let budget = BLOCKS_PER_READ;
        loop {
            if self.consumed_chunks > 0 {
                let chunkno = self.consumed_chunks - 1;
                let chunk_size = self.chunk_sizes[chunkno];
                if chunk_size == MAX_ENTRIES_PER_CHUNK {
                    // bitmap: scan for set bits
                    while self.chunk_position < BLOCKS_PER_CHUNK && blocks.len() < budget {
                        let off = self.chunk_position;
                        if self.chunk_data[(off / BLOCKS_PER_ENTRY) as usize]
                            & (1 << (off % BLOCKS_PER_ENTRY))
                            != 0
                        {
                            blocks.push(chunkno as u32 * BLOCKS_PER_CHUNK + off);
                        }
                        self.chunk_position += 1;
                    }
                } else {
                    while self.chunk_position < chunk_size as u32 && blocks.len() < budget {
                        blocks.push(
                            chunkno as u32 * BLOCKS_PER_CHUNK
                                + self.chunk_data[self.chunk_position as usize] as u32,
                        );
                        self.chunk_position += 1;
                    }
                }
            }

            if blocks.len() >= budget {
                return Ok(());
            }
            if self.consumed_chunks == self.total_chunks {
                return Ok(());
            }

            // Read data for the next chunk and reset the scan position. The
            // chunk may be empty, consuming no bytes from the file.
            let next_chunk_size = self.chunk_sizes[self.consumed_chunks] as usize;
            self.chunk_data.clear();
            for _ in 0..next_chunk_size {
                let mut word = [0u8; 2];
                self.read_exact_buffered(&mut word)?;
                self.chunk_data.push(u16::from_le_bytes(word));
            }
            self.consumed_chunks += 1;
            self.chunk_position = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(relnum: u32) -> RelFileLocator {
        RelFileLocator {
            spc_oid: 1664,
            db_oid: 5,
            rel_number: relnum,
        }
    }

    fn round_trip(table: &BlockRefTable) -> BlockRefTable {
        let mut buf = Vec::new();
        table.write_to(&mut buf).unwrap();
        BlockRefTable::read_from(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn set_and_get_blocks() {
        let mut table = BlockRefTable::new();
        let blocks = [0u32, 1, 2, 500, 501, 131072, 131100];
        for &b in &blocks {
            table.mark_block_modified(rel(16384), 0, b);
        }
        table.set_limit_block(rel(16384), 0, 200000);

        let reloaded = round_trip(&table);
        let entry = reloaded.get_entry(rel(16384), 0).unwrap();
        assert_eq!(entry.limit_block, 200000);
        assert_eq!(entry.blocks_in_range(0, 200000), blocks.to_vec());
        assert_eq!(entry.blocks_in_range(0, 1000), vec![0, 1, 2, 500, 501]);
    }

    #[test]
    fn marking_twice_is_idempotent() {
        let mut once = BlockRefTable::new();
        let mut twice = BlockRefTable::new();
        for &b in &[7u32, 8, 9, 70000] {
            once.mark_block_modified(rel(1), 0, b);
            twice.mark_block_modified(rel(1), 0, b);
            twice.mark_block_modified(rel(1), 0, b);
        }
        let mut a = Vec::new();
        let mut b = Vec::new();
        once.write_to(&mut a).unwrap();
        twice.write_to(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn limit_block_truncates() {
        let mut table = BlockRefTable::new();
        for b in [10u32, 100, 65535, 65536, 70000, 131072] {
            table.mark_block_modified(rel(2), 0, b);
        }
        table.set_limit_block(rel(2), 0, 65536);
        let entry = table.get_entry(rel(2), 0).unwrap();
        // nothing at or above the limit survives
        assert_eq!(entry.blocks_in_range(0, u32::MAX & !0xF), vec![10, 100, 65535]);

        // raising the limit again does not resurrect anything
        table.set_limit_block(rel(2), 0, 200000);
        let entry = table.get_entry(rel(2), 0).unwrap();
        assert_eq!(entry.limit_block, 65536);
    }

    #[test]
    fn array_converts_to_bitmap() {
        let mut table = BlockRefTable::new();
        // fill one chunk beyond the array limit
        let n = MAX_ENTRIES_PER_CHUNK as u32 + 10;
        for b in 0..n {
            table.mark_block_modified(rel(3), 0, b * 2);
        }
        let entry = table.get_entry(rel(3), 0).unwrap();
        assert!(entry.is_bitmap(0));
        let expected: Vec<u32> = (0..n).map(|b| b * 2).collect();
        assert_eq!(entry.blocks_in_range(0, BLOCKS_PER_CHUNK * 2), expected);

        // bitmap chunks survive serialization
        let reloaded = round_trip(&table);
        let entry = reloaded.get_entry(rel(3), 0).unwrap();
        assert_eq!(entry.blocks_in_range(0, BLOCKS_PER_CHUNK * 2), expected);
    }

    #[test]
    fn multiple_relations_sort_by_locator() {
        let mut table = BlockRefTable::new();
        table.mark_block_modified(rel(20), 1, 5);
        table.mark_block_modified(rel(10), 0, 1);
        table.mark_block_modified(
            RelFileLocator {
                spc_oid: 1663,
                db_oid: 5,
                rel_number: 99,
            },
            0,
            3,
        );
        let keys: Vec<_> = table.iter().map(|(k, _)| *k).collect();
        // ascending (spc, db, rel, fork)
        assert_eq!(keys[0].0.spc_oid, 1663);
        assert_eq!(keys[1].0.rel_number, 10);
        assert_eq!(keys[2].0.rel_number, 20);

        let reloaded = round_trip(&table);
        assert_eq!(reloaded, table);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        BlockRefTable::new().write_to(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        assert!(matches!(
            BlockRefTable::read_from(&mut buf.as_slice()),
            Err(BrtError::Corrupt(_))
        ));
    }
}
