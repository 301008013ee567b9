//! C4: the buffer-packed overview backend. One or more fixed-size buffer
//! files divided into 8 KiB blocks; groups are linked chains of index
//! blocks (article-number -> data location) and data blocks (raw overview
//! text). The free-block bitmap and each group's high/low/count header
//! live in the SysV shared segment of [`super::shmem`]; index and data
//! blocks themselves are read/written directly against the buffer file.
//!
//! The legacy format's byte-order quirks and bias tricks are dropped per
//! the design notes: every block carries an explicit little-endian layout
//! and a trailing CRC32 checksum, and corruption is detected rather than
//! silently propagated.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error;
use crate::token::Token;

use super::shmem::{ftok_key, SharedRegion};

pub const BLOCK_SIZE: usize = 8192;

const INDEX_MAGIC: u32 = 0x4F42_4831;
const DATA_MAGIC: u32 = 0x4F42_4432;

const GROUP_NAME_CAP: usize = 255;
const ENTRY_BYTES: usize = 8 + 6 + 4 + 4 + 8 + 8;
const FIXED_INDEX_HEADER_LEN: usize =
    4 + 1 + 1 + GROUP_NAME_CAP + 8 + 8 + 8 + 1 + 6 + 6 + 6 + 6 + 6 + 2;
const MAX_ENTRIES_PER_INDEX_BLOCK: usize = (BLOCK_SIZE - 4 - FIXED_INDEX_HEADER_LEN) / ENTRY_BYTES;

const FIXED_DATA_HEADER_LEN: usize = 4 + 4 + 6;
const DATA_BLOCK_CAPACITY: usize = BLOCK_SIZE - 4 - FIXED_DATA_HEADER_LEN;

/// An arena index: which buffer file, and which 8 KiB block within it.
/// Never an owning pointer -- cross-references between blocks are always
/// these coordinates (§9 "Cyclic references").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPtr {
    pub buffer_id: u16,
    pub block_id: u32,
}

impl BlockPtr {
    pub const NULL: BlockPtr = BlockPtr { buffer_id: u16::MAX, block_id: u32::MAX };

    pub fn is_null(&self) -> bool {
        *self == BlockPtr::NULL
    }

    fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_u16::<LittleEndian>(self.buffer_id)?;
        w.write_u32::<LittleEndian>(self.block_id)
    }

    fn read(r: &mut impl Read) -> std::io::Result<Self> {
        let buffer_id = r.read_u16::<LittleEndian>()?;
        let block_id = r.read_u32::<LittleEndian>()?;
        Ok(BlockPtr { buffer_id, block_id })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// Negative means tombstoned; `abs(article_num)` is the real number.
    pub article_num: i64,
    pub data_ptr: BlockPtr,
    pub data_offset: u32,
    pub overlen: u32,
    pub arrived: i64,
    pub expires: i64,
}

impl IndexEntry {
    pub fn is_tombstone(&self) -> bool {
        self.article_num < 0
    }

    pub fn number(&self) -> u64 {
        self.article_num.unsigned_abs()
    }
}

#[derive(Debug, Clone)]
struct IndexBlock {
    is_head: bool,
    group_name: String,
    high: u64,
    low: u64,
    count: u64,
    flag: u8,
    chain_head: BlockPtr,
    chain_tail: BlockPtr,
    idx_head: BlockPtr,
    idx_tail: BlockPtr,
    next_index: BlockPtr,
    entries: Vec<IndexEntry>,
}

impl IndexBlock {
    fn new_head(group_name: &str) -> Self {
        IndexBlock {
            is_head: true,
            group_name: group_name.to_string(),
            high: 0,
            low: 0,
            count: 0,
            flag: b'y',
            chain_head: BlockPtr::NULL,
            chain_tail: BlockPtr::NULL,
            idx_head: BlockPtr::NULL,
            idx_tail: BlockPtr::NULL,
            next_index: BlockPtr::NULL,
            entries: Vec::new(),
        }
    }

    fn encode(&self) -> Result<[u8; BLOCK_SIZE], Error> {
        if self.entries.len() > MAX_ENTRIES_PER_INDEX_BLOCK {
            return Err(Error::internal("index block overflow"));
        }
        let mut out = vec![0u8; BLOCK_SIZE];
        {
            let mut cur = Cursor::new(&mut out[..BLOCK_SIZE - 4]);
            cur.write_u32::<LittleEndian>(INDEX_MAGIC).unwrap();
            cur.write_u8(self.is_head as u8).unwrap();

            let name_bytes = self.group_name.as_bytes();
            let name_len = name_bytes.len().min(GROUP_NAME_CAP);
            cur.write_u8(name_len as u8).unwrap();
            let mut name_buf = [0u8; GROUP_NAME_CAP];
            name_buf[..name_len].copy_from_slice(&name_bytes[..name_len]);
            cur.write_all(&name_buf).unwrap();

            cur.write_u64::<LittleEndian>(self.high).unwrap();
            cur.write_u64::<LittleEndian>(self.low).unwrap();
            cur.write_u64::<LittleEndian>(self.count).unwrap();
            cur.write_u8(self.flag).unwrap();
            self.chain_head.write(&mut cur).unwrap();
            self.chain_tail.write(&mut cur).unwrap();
            self.idx_head.write(&mut cur).unwrap();
            self.idx_tail.write(&mut cur).unwrap();
            self.next_index.write(&mut cur).unwrap();
            cur.write_u16::<LittleEndian>(self.entries.len() as u16).unwrap();

            for e in &self.entries {
                cur.write_i64::<LittleEndian>(e.article_num).unwrap();
                e.data_ptr.write(&mut cur).unwrap();
                cur.write_u32::<LittleEndian>(e.data_offset).unwrap();
                cur.write_u32::<LittleEndian>(e.overlen).unwrap();
                cur.write_i64::<LittleEndian>(e.arrived).unwrap();
                cur.write_i64::<LittleEndian>(e.expires).unwrap();
            }
        }
        let checksum = crc32fast::hash(&out[..BLOCK_SIZE - 4]);
        (&mut out[BLOCK_SIZE - 4..]).write_u32::<LittleEndian>(checksum).unwrap();
        let mut fixed = [0u8; BLOCK_SIZE];
        fixed.copy_from_slice(&out);
        Ok(fixed)
    }

    fn decode(path: &Path, block_id: u32, data: &[u8]) -> Result<Self, Error> {
        let checksum = crc32fast::hash(&data[..BLOCK_SIZE - 4]);
        let stored = (&data[BLOCK_SIZE - 4..]).read_u32::<LittleEndian>().unwrap();
        if checksum != stored {
            return Err(Error::corrupt(path, format!("checksum mismatch in index block {}", block_id)));
        }

        let mut cur = Cursor::new(&data[..BLOCK_SIZE - 4]);
        let magic = cur.read_u32::<LittleEndian>().map_err(Error::Io)?;
        if magic != INDEX_MAGIC {
            return Err(Error::corrupt(path, format!("bad magic in index block {}", block_id)));
        }
        let is_head = cur.read_u8().map_err(Error::Io)? != 0;
        let name_len = cur.read_u8().map_err(Error::Io)? as usize;
        let mut name_buf = [0u8; GROUP_NAME_CAP];
        cur.read_exact(&mut name_buf).map_err(Error::Io)?;
        let group_name = String::from_utf8_lossy(&name_buf[..name_len.min(GROUP_NAME_CAP)]).into_owned();

        let high = cur.read_u64::<LittleEndian>().map_err(Error::Io)?;
        let low = cur.read_u64::<LittleEndian>().map_err(Error::Io)?;
        let count = cur.read_u64::<LittleEndian>().map_err(Error::Io)?;
        let flag = cur.read_u8().map_err(Error::Io)?;
        let chain_head = BlockPtr::read(&mut cur).map_err(Error::Io)?;
        let chain_tail = BlockPtr::read(&mut cur).map_err(Error::Io)?;
        let idx_head = BlockPtr::read(&mut cur).map_err(Error::Io)?;
        let idx_tail = BlockPtr::read(&mut cur).map_err(Error::Io)?;
        let next_index = BlockPtr::read(&mut cur).map_err(Error::Io)?;
        let entry_count = cur.read_u16::<LittleEndian>().map_err(Error::Io)? as usize;

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let article_num = cur.read_i64::<LittleEndian>().map_err(Error::Io)?;
            let data_ptr = BlockPtr::read(&mut cur).map_err(Error::Io)?;
            let data_offset = cur.read_u32::<LittleEndian>().map_err(Error::Io)?;
            let overlen = cur.read_u32::<LittleEndian>().map_err(Error::Io)?;
            let arrived = cur.read_i64::<LittleEndian>().map_err(Error::Io)?;
            let expires = cur.read_i64::<LittleEndian>().map_err(Error::Io)?;
            entries.push(IndexEntry { article_num, data_ptr, data_offset, overlen, arrived, expires });
        }

        Ok(IndexBlock {
            is_head,
            group_name,
            high,
            low,
            count,
            flag,
            chain_head,
            chain_tail,
            idx_head,
            idx_tail,
            next_index,
            entries,
        })
    }
}

struct DataBlock {
    used: u32,
    next: BlockPtr,
    bytes: Vec<u8>,
}

impl DataBlock {
    fn new() -> Self {
        DataBlock { used: 0, next: BlockPtr::NULL, bytes: vec![0u8; DATA_BLOCK_CAPACITY] }
    }

    fn remaining(&self) -> usize {
        DATA_BLOCK_CAPACITY - self.used as usize
    }

    fn append(&mut self, data: &[u8]) -> u32 {
        let offset = self.used;
        self.bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        self.used += data.len() as u32;
        offset
    }

    fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut out = [0u8; BLOCK_SIZE];
        {
            let mut cur = Cursor::new(&mut out[..BLOCK_SIZE - 4]);
            cur.write_u32::<LittleEndian>(DATA_MAGIC).unwrap();
            cur.write_u32::<LittleEndian>(self.used).unwrap();
            self.next.write(&mut cur).unwrap();
            cur.write_all(&self.bytes).unwrap();
        }
        let checksum = crc32fast::hash(&out[..BLOCK_SIZE - 4]);
        (&mut out[BLOCK_SIZE - 4..]).write_u32::<LittleEndian>(checksum).unwrap();
        out
    }

    fn decode(path: &Path, block_id: u32, data: &[u8]) -> Result<Self, Error> {
        let checksum = crc32fast::hash(&data[..BLOCK_SIZE - 4]);
        let stored = (&data[BLOCK_SIZE - 4..]).read_u32::<LittleEndian>().unwrap();
        if checksum != stored {
            return Err(Error::corrupt(path, format!("checksum mismatch in data block {}", block_id)));
        }
        let mut cur = Cursor::new(&data[..BLOCK_SIZE - 4]);
        let magic = cur.read_u32::<LittleEndian>().map_err(Error::Io)?;
        if magic != DATA_MAGIC {
            return Err(Error::corrupt(path, format!("bad magic in data block {}", block_id)));
        }
        let used = cur.read_u32::<LittleEndian>().map_err(Error::Io)?;
        let next = BlockPtr::read(&mut cur).map_err(Error::Io)?;
        let mut bytes = vec![0u8; DATA_BLOCK_CAPACITY];
        cur.read_exact(&mut bytes).map_err(Error::Io)?;
        Ok(DataBlock { used, next, bytes })
    }
}

/// The block arena: a single buffer file, blocks allocated from a free
/// bitmap kept in shared memory. Block 0 is reserved for the segment's own
/// bookkeeping and never allocated to a group.
struct Arena {
    file: File,
    path: PathBuf,
    block_count: u32,
    bitmap: SharedRegion<u8>,
}

const RESERVED_BLOCKS: u32 = 1;
const BITMAP_BYTES: usize = 64 * 1024; // supports up to 512K blocks (4 GiB at 8 KiB/block)

impl Arena {
    fn open(path: PathBuf, initial_blocks: u32) -> Result<Self, Error> {
        let needed = initial_blocks.max(RESERVED_BLOCKS + 1);
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let needed_bytes = needed as u64 * BLOCK_SIZE as u64;
        if len < needed_bytes {
            file.set_len(needed_bytes)?;
        }
        let block_count = (file.metadata()?.len() / BLOCK_SIZE as u64) as u32;

        let key = ftok_key(&path, 1)?;
        let bitmap = SharedRegion::create(key, BITMAP_BYTES)?;

        Ok(Arena { file, path, block_count, bitmap })
    }

    fn ensure_blocks(&mut self, at_least: u32) -> Result<(), Error> {
        if at_least > self.block_count {
            self.file.set_len(at_least as u64 * BLOCK_SIZE as u64)?;
            self.block_count = at_least;
        }
        Ok(())
    }

    fn read_block(&mut self, id: u32) -> Result<[u8; BLOCK_SIZE], Error> {
        self.file.seek(SeekFrom::Start(id as u64 * BLOCK_SIZE as u64))?;
        let mut buf = [0u8; BLOCK_SIZE];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_block(&mut self, id: u32, data: &[u8; BLOCK_SIZE]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(id as u64 * BLOCK_SIZE as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn bitmap_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.bitmap.as_mut_ptr(), BITMAP_BYTES) }
    }

    /// Allocates a fresh block under the global free-bitmap critical
    /// section (the C7 semaphore pair).
    fn alloc_block(&mut self) -> Result<u32, Error> {
        self.bitmap.semaphores().writer_lock()?;
        let result = self.alloc_block_locked();
        self.bitmap.semaphores().writer_unlock()?;
        result
    }

    fn alloc_block_locked(&mut self) -> Result<u32, Error> {
        let block_count = self.block_count;
        let bitmap = self.bitmap_slice();
        for byte_idx in 0..BITMAP_BYTES {
            if bitmap[byte_idx] == 0xff {
                continue;
            }
            for bit in 0..8u32 {
                let id = (byte_idx as u32) * 8 + bit;
                if id < RESERVED_BLOCKS {
                    continue;
                }
                if bitmap[byte_idx] & (1 << bit) == 0 {
                    if id >= block_count && id >= (BITMAP_BYTES as u32) * 8 {
                        return Err(Error::NoSpace("free bitmap exhausted".into()));
                    }
                    bitmap[byte_idx] |= 1 << bit;
                    if id >= self.block_count {
                        self.ensure_blocks(id + 1)?;
                    }
                    return Ok(id);
                }
            }
        }
        Err(Error::NoSpace("buffer file has no free blocks left".into()))
    }

    #[allow(dead_code)]
    fn free_block(&mut self, id: u32) -> Result<(), Error> {
        self.bitmap.semaphores().writer_lock()?;
        let bitmap = self.bitmap_slice();
        let byte_idx = (id / 8) as usize;
        let bit = id % 8;
        bitmap[byte_idx] &= !(1 << bit);
        self.bitmap.semaphores().writer_unlock()
    }
}

/// One range-scan cursor. Holds the group name so `search_next` can
/// re-acquire the shared lock per page rather than for the whole scan.
pub struct Search {
    group: String,
    lo: u64,
    hi: u64,
    next_ptr: BlockPtr,
    entry_idx: usize,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub number: u64,
    pub token: Token,
    pub overview: Vec<u8>,
    pub arrived: i64,
    pub expires: i64,
}

/// The buffindexed overview backend. `storage_backend` identifies which
/// storage-manager backend produced the tokens stored alongside overview
/// entries, so data blocks can carry a token without needing a second
/// lookup.
pub struct Buffindexed {
    arena: Mutex<Arena>,
    group_heads: RwLock<HashMap<String, BlockPtr>>,
    group_locks: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
    sync_every: u32,
}

impl Buffindexed {
    pub fn open(buffer_path: impl AsRef<Path>, sync_every: u32) -> Result<Self, Error> {
        let arena = Arena::open(buffer_path.as_ref().to_path_buf(), RESERVED_BLOCKS + 16)?;
        Ok(Buffindexed {
            arena: Mutex::new(arena),
            group_heads: RwLock::new(HashMap::new()),
            group_locks: Mutex::new(HashMap::new()),
            sync_every,
        })
    }

    /// The per-group write lock of §5: "adds are totally ordered by the
    /// acquisition order of the per-group write lock; this order equals
    /// the order of assigned article numbers." Held across the
    /// peek-then-append in [`Self::add_next`] so two concurrent appends to
    /// the same group can never compute the same next number.
    fn per_group_lock(&self, group: &str) -> std::sync::Arc<Mutex<()>> {
        self.group_locks.lock().unwrap().entry(group.to_string()).or_insert_with(|| std::sync::Arc::new(Mutex::new(()))).clone()
    }

    /// Runs `body` with every one of `groups`' write locks held, sorted
    /// first so two callers injecting into an overlapping set of groups
    /// always acquire them in the same order. Lets a multi-group injection
    /// peek each group's high-water mark and commit its entries in one
    /// atomic span, rather than racing a second injector between the peek
    /// and the write.
    pub fn with_group_locks<R>(&self, groups: &[String], body: impl FnOnce() -> Result<R, Error>) -> Result<R, Error> {
        let mut names: Vec<String> = groups.to_vec();
        names.sort();
        names.dedup();
        let locks: Vec<_> = names.iter().map(|g| self.per_group_lock(g)).collect();
        let _guards: Vec<_> = locks.iter().map(|l| l.lock().unwrap()).collect();
        body()
    }

    pub fn group_add(&self, name: &str) -> Result<(), Error> {
        if self.group_heads.read().unwrap().contains_key(name) {
            return Ok(());
        }
        let mut arena = self.arena.lock().unwrap();
        let block_id = arena.alloc_block()?;
        let head = IndexBlock::new_head(name);
        arena.write_block(block_id, &head.encode()?)?;
        let ptr = BlockPtr { buffer_id: 0, block_id };
        self.group_heads.write().unwrap().insert(name.to_string(), ptr);
        Ok(())
    }

    pub fn group_stats(&self, name: &str) -> Result<(u64, u64, u64, u8), Error> {
        let head_ptr = self.head_ptr(name)?;
        let mut arena = self.arena.lock().unwrap();
        let head = self.load_index(&mut arena, head_ptr)?;
        Ok((head.low, head.high, head.count, head.flag))
    }

    fn head_ptr(&self, name: &str) -> Result<BlockPtr, Error> {
        self.group_heads.read().unwrap().get(name).copied().ok_or(Error::NotFound)
    }

    fn load_index(&self, arena: &mut Arena, ptr: BlockPtr) -> Result<IndexBlock, Error> {
        let raw = arena.read_block(ptr.block_id)?;
        IndexBlock::decode(&arena.path, ptr.block_id, &raw)
    }

    fn save_index(&self, arena: &mut Arena, ptr: BlockPtr, block: &IndexBlock) -> Result<(), Error> {
        arena.write_block(ptr.block_id, &block.encode()?)
    }

    /// Appends one overview record for `number` to `group`, allocating new
    /// data/index blocks from the free bitmap as needed.
    pub fn add(
        &self,
        group: &str,
        number: u64,
        overview: &[u8],
        token: Token,
        arrived: i64,
        expires: i64,
    ) -> Result<(), Error> {
        let head_ptr = self.head_ptr(group)?;
        let mut arena = self.arena.lock().unwrap();
        let mut head = self.load_index(&mut arena, head_ptr)?;

        // Find (or allocate) the tail data block with room for this record.
        let mut token_bytes = Vec::with_capacity(18 + overview.len());
        token_bytes.push(token.backend);
        token_bytes.push(token.class);
        token_bytes.extend_from_slice(&token.payload);
        token_bytes.extend_from_slice(overview);
        if token_bytes.len() > DATA_BLOCK_CAPACITY {
            return Err(Error::internal("overview record too large for one data block"));
        }

        let (data_ptr, data_offset) = if head.chain_tail.is_null() {
            let block_id = arena.alloc_block()?;
            let mut block = DataBlock::new();
            let offset = block.append(&token_bytes);
            arena.write_block(block_id, &block.encode())?;
            let ptr = BlockPtr { buffer_id: 0, block_id };
            head.chain_head = ptr;
            head.chain_tail = ptr;
            (ptr, offset)
        } else {
            let tail_ptr = head.chain_tail;
            let raw = arena.read_block(tail_ptr.block_id)?;
            let mut tail = DataBlock::decode(&arena.path, tail_ptr.block_id, &raw)?;
            if tail.remaining() >= token_bytes.len() {
                let offset = tail.append(&token_bytes);
                arena.write_block(tail_ptr.block_id, &tail.encode())?;
                (tail_ptr, offset)
            } else {
                let block_id = arena.alloc_block()?;
                let mut block = DataBlock::new();
                let offset = block.append(&token_bytes);
                arena.write_block(block_id, &block.encode())?;
                let ptr = BlockPtr { buffer_id: 0, block_id };
                tail.next = ptr;
                arena.write_block(tail_ptr.block_id, &tail.encode())?;
                head.chain_tail = ptr;
                (ptr, offset)
            }
        };

        // Find (or allocate) the tail index block with room for one more entry.
        let entry = IndexEntry {
            article_num: number as i64,
            data_ptr,
            data_offset,
            overlen: token_bytes.len() as u32,
            arrived,
            expires,
        };

        if head.idx_head.is_null() {
            head.entries.push(entry);
            head.idx_head = head_ptr;
            head.idx_tail = head_ptr;
        } else if head.idx_tail == head_ptr {
            if head.entries.len() < MAX_ENTRIES_PER_INDEX_BLOCK {
                head.entries.push(entry);
            } else {
                self.append_overflow_index(&mut arena, &mut head, head_ptr, entry)?;
            }
        } else {
            let tail_ptr = head.idx_tail;
            let mut tail = self.load_index(&mut arena, tail_ptr)?;
            if tail.entries.len() < MAX_ENTRIES_PER_INDEX_BLOCK {
                tail.entries.push(entry);
                self.save_index(&mut arena, tail_ptr, &tail)?;
            } else {
                let block_id = arena.alloc_block()?;
                let mut overflow = IndexBlock { is_head: false, ..tail.clone() };
                overflow.group_name.clear();
                overflow.entries = vec![entry];
                overflow.next_index = BlockPtr::NULL;
                let ptr = BlockPtr { buffer_id: 0, block_id };
                self.save_index(&mut arena, ptr, &overflow)?;
                tail.next_index = ptr;
                self.save_index(&mut arena, tail_ptr, &tail)?;
                head.idx_tail = ptr;
            }
        }

        head.high = head.high.max(number);
        head.count += 1;
        self.save_index(&mut arena, head_ptr, &head)?;
        Ok(())
    }

    /// Assigns the next article number for `group` and appends the record
    /// under that number, atomically with respect to other `add_next`
    /// callers for the same group. This is how the injection pipeline
    /// numbers articles; [`Self::add`] itself still takes an explicit
    /// number for callers (rebuild tooling, tests) that already know it.
    pub fn add_next(&self, group: &str, overview: &[u8], token: Token, arrived: i64, expires: i64) -> Result<u64, Error> {
        let lock = self.per_group_lock(group);
        let _guard = lock.lock().unwrap();
        let (_, high, _, _) = self.group_stats(group)?;
        let number = high + 1;
        self.add(group, number, overview, token, arrived, expires)?;
        Ok(number)
    }

    fn append_overflow_index(
        &self,
        arena: &mut Arena,
        head: &mut IndexBlock,
        head_ptr: BlockPtr,
        entry: IndexEntry,
    ) -> Result<(), Error> {
        let block_id = arena.alloc_block()?;
        let mut overflow = IndexBlock::new_head(&head.group_name);
        overflow.is_head = false;
        overflow.group_name.clear();
        overflow.entries = vec![entry];
        let ptr = BlockPtr { buffer_id: 0, block_id };
        self.save_index(arena, ptr, &overflow)?;
        head.next_index = ptr;
        head.idx_tail = ptr;
        let _ = head_ptr;
        Ok(())
    }

    pub fn cancel(&self, group: &str, number: u64) -> Result<bool, Error> {
        let head_ptr = self.head_ptr(group)?;
        let mut arena = self.arena.lock().unwrap();
        let mut head = self.load_index(&mut arena, head_ptr)?;

        let mut ptr = head_ptr;
        let mut block = head.clone();
        loop {
            if let Some(e) = block.entries.iter_mut().find(|e| e.number() == number && !e.is_tombstone()) {
                e.article_num = -(number as i64);
                if ptr == head_ptr {
                    head = block;
                    head.count = head.count.saturating_sub(1);
                    self.save_index(&mut arena, head_ptr, &head)?;
                } else {
                    self.save_index(&mut arena, ptr, &block)?;
                    head.count = head.count.saturating_sub(1);
                    self.save_index(&mut arena, head_ptr, &head)?;
                }
                return Ok(true);
            }
            if block.next_index.is_null() {
                return Ok(false);
            }
            ptr = block.next_index;
            block = self.load_index(&mut arena, ptr)?;
        }
    }

    pub fn expire_group(&self, group: &str, cutoff: i64, now: i64) -> Result<u64, Error> {
        let head_ptr = self.head_ptr(group)?;
        let mut arena = self.arena.lock().unwrap();
        let mut ptr = head_ptr;
        let mut reclaimed = 0u64;
        loop {
            let mut block = self.load_index(&mut arena, ptr)?;
            for e in block.entries.iter_mut() {
                let past_retention = e.arrived < cutoff;
                let past_expiry = e.expires != 0 && e.expires < now;
                if !e.is_tombstone() && past_retention && past_expiry {
                    e.article_num = -(e.number() as i64);
                    reclaimed += 1;
                }
            }
            self.save_index(&mut arena, ptr, &block)?;
            if block.next_index.is_null() {
                break;
            }
            ptr = block.next_index;
        }
        if reclaimed > 0 {
            let mut head = self.load_index(&mut arena, head_ptr)?;
            head.count = head.count.saturating_sub(reclaimed);
            self.save_index(&mut arena, head_ptr, &head)?;
        }
        Ok(reclaimed)
    }

    pub fn search_open(&self, group: &str, lo: u64, hi: u64) -> Result<Search, Error> {
        let head_ptr = self.head_ptr(group)?;
        Ok(Search { group: group.to_string(), lo, hi, next_ptr: head_ptr, entry_idx: 0 })
    }

    pub fn search_next(&self, search: &mut Search) -> Result<Option<SearchResult>, Error> {
        let mut arena = self.arena.lock().unwrap();
        loop {
            if search.next_ptr.is_null() {
                return Ok(None);
            }
            let block = self.load_index(&mut arena, search.next_ptr)?;
            while search.entry_idx < block.entries.len() {
                let entry = block.entries[search.entry_idx];
                search.entry_idx += 1;
                if entry.is_tombstone() {
                    continue;
                }
                let n = entry.number();
                if n < search.lo {
                    continue;
                }
                if n > search.hi {
                    search.next_ptr = BlockPtr::NULL;
                    return Ok(None);
                }
                let data = self.read_data(&mut arena, entry.data_ptr, entry.data_offset, entry.overlen)?;
                let token = Token::new(data[0], data[1], {
                    let mut p = [0u8; 16];
                    p.copy_from_slice(&data[2..18]);
                    p
                });
                return Ok(Some(SearchResult {
                    number: n,
                    token,
                    overview: data[18..].to_vec(),
                    arrived: entry.arrived,
                    expires: entry.expires,
                }));
            }
            search.next_ptr = block.next_index;
            search.entry_idx = 0;
        }
    }

    fn read_data(&self, arena: &mut Arena, ptr: BlockPtr, offset: u32, len: u32) -> Result<Vec<u8>, Error> {
        let raw = arena.read_block(ptr.block_id)?;
        let block = DataBlock::decode(&arena.path, ptr.block_id, &raw)?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > block.bytes.len() {
            return Err(Error::corrupt(arena.path.as_path(), "overview record runs past its data block"));
        }
        Ok(block.bytes[start..end].to_vec())
    }

    pub fn token_for(&self, group: &str, number: u64) -> Result<Option<Token>, Error> {
        let mut search = self.search_open(group, number, number)?;
        Ok(self.search_next(&mut search)?.map(|r| r.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir) -> Buffindexed {
        Buffindexed::open(dir.path().join("buffer"), 10).unwrap()
    }

    fn sample_token(n: u8) -> Token {
        Token::new(1, 0x41, [n; 16])
    }

    #[test]
    fn add_then_search_returns_strictly_ascending_numbers() {
        let dir = tempdir().unwrap();
        let ov = open(&dir);
        ov.group_add("misc.test").unwrap();
        for n in 1..=20u64 {
            ov.add("misc.test", n, format!("line {}", n).as_bytes(), sample_token(n as u8), 0, 0).unwrap();
        }
        let mut search = ov.search_open("misc.test", 0, u64::MAX).unwrap();
        let mut last = 0u64;
        let mut count = 0;
        while let Some(result) = ov.search_next(&mut search).unwrap() {
            assert!(result.number > last);
            last = result.number;
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn cancel_removes_entry_from_scans() {
        let dir = tempdir().unwrap();
        let ov = open(&dir);
        ov.group_add("misc.test").unwrap();
        for n in 1..=5u64 {
            ov.add("misc.test", n, b"x", sample_token(n as u8), 0, 0).unwrap();
        }
        assert!(ov.cancel("misc.test", 3).unwrap());

        let mut search = ov.search_open("misc.test", 0, u64::MAX).unwrap();
        let mut seen = Vec::new();
        while let Some(r) = ov.search_next(&mut search).unwrap() {
            seen.push(r.number);
        }
        assert_eq!(seen, vec![1, 2, 4, 5]);
    }

    #[test]
    fn group_stats_tracks_high_and_count() {
        let dir = tempdir().unwrap();
        let ov = open(&dir);
        ov.group_add("misc.test").unwrap();
        for n in 1..=7u64 {
            ov.add("misc.test", n, b"x", sample_token(n as u8), 0, 0).unwrap();
        }
        let (_, high, count, _) = ov.group_stats("misc.test").unwrap();
        assert_eq!(high, 7);
        assert_eq!(count, 7);
    }

    #[test]
    fn overflowing_a_single_index_block_spans_multiple_blocks() {
        let dir = tempdir().unwrap();
        let ov = open(&dir);
        ov.group_add("big.test").unwrap();
        let total = (MAX_ENTRIES_PER_INDEX_BLOCK as u64) + 50;
        for n in 1..=total {
            ov.add("big.test", n, b"x", sample_token((n % 256) as u8), 0, 0).unwrap();
        }
        let mut search = ov.search_open("big.test", 0, u64::MAX).unwrap();
        let mut count = 0u64;
        while ov.search_next(&mut search).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, total);
    }

    #[test]
    fn expire_group_tombstones_only_entries_past_both_retention_and_expiry() {
        let dir = tempdir().unwrap();
        let ov = open(&dir);
        ov.group_add("misc.test").unwrap();

        // Old arrival, explicit expiry already past: expires.
        ov.add("misc.test", 1, b"x", sample_token(1), 100, 500).unwrap();
        // Old arrival, no expiry set (0 means "never"): survives.
        ov.add("misc.test", 2, b"x", sample_token(2), 100, 0).unwrap();
        // Old arrival, expiry still in the future: survives.
        ov.add("misc.test", 3, b"x", sample_token(3), 100, 5000).unwrap();
        // Recent arrival, even with an already-past expiry: survives
        // (hasn't cleared the retention cutoff yet).
        ov.add("misc.test", 4, b"x", sample_token(4), 9000, 500).unwrap();

        let reclaimed = ov.expire_group("misc.test", /* cutoff */ 1000, /* now */ 1000).unwrap();
        assert_eq!(reclaimed, 1);

        let mut search = ov.search_open("misc.test", 0, u64::MAX).unwrap();
        let mut remaining = Vec::new();
        while let Some(r) = ov.search_next(&mut search).unwrap() {
            remaining.push(r.number);
        }
        assert_eq!(remaining, vec![2, 3, 4]);
    }

    #[test]
    fn add_next_assigns_sequential_numbers() {
        let dir = tempdir().unwrap();
        let ov = open(&dir);
        ov.group_add("misc.test").unwrap();
        let a = ov.add_next("misc.test", b"one", sample_token(1), 0, 0).unwrap();
        let b = ov.add_next("misc.test", b"two", sample_token(2), 0, 0).unwrap();
        let c = ov.add_next("misc.test", b"three", sample_token(3), 0, 0).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn add_next_is_consistent_under_concurrent_callers() {
        let dir = tempdir().unwrap();
        let ov = std::sync::Arc::new(open(&dir));
        ov.group_add("misc.test").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ov = ov.clone();
                std::thread::spawn(move || ov.add_next("misc.test", b"x", sample_token(i), 0, 0).unwrap())
            })
            .collect();
        let mut numbers: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
    }
}
