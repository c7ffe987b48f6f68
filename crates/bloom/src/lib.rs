//! # Bloom Filter
//!
//! A space-efficient probabilistic set of 64-bit stream hashes.
//!
//! A bloom filter can tell you with certainty that a hash is **not** in the
//! set (no false negatives), but may occasionally report that a hash **is** in
//! the set when it isn't (false positives).
//!
//! ## Usage in the index
//!
//! Every index table gets a sidecar filter built from the stream hashes it
//! contains. A lookup consults the filter first: if it says "not present" the
//! table is skipped without touching its file.
//!
//! ## Sidecar layout
//!
//! ```text
//! [magic: u32 "IXBF"][crc32: u32][num_bits: u64][num_hashes: u32][items: u64][bits_len: u32][bits]
//! ```
//!
//! The CRC32 covers everything after itself. A damaged sidecar is reported as
//! `InvalidData` so the caller can fall back to reading the table. `items`
//! counts the inserts, which lets the owner of a sidecar tell whether it was
//! built for the data next to it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::new(1000, 0.01);
//! bf.insert(0xdead_beef);
//! assert!(bf.may_contain(0xdead_beef));
//! ```
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Magic number at the start of a sidecar file (ASCII "IXBF").
pub const BLOOM_MAGIC: u32 = 0x4642_5849;

/// Sidecars larger than this are treated as corrupt (128 MiB).
const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;

/// A bloom filter backed by a bit vector with `k` derived probe positions.
///
/// Probes use double hashing, `h(i) = h1 + i * h2`, where both halves are
/// mixed from the stream hash with different seeds. Stream hashes are often
/// small or sequential in tests, so they are mixed before use.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
    items: u64,
}

impl BloomFilter {
    /// Creates a new bloom filter sized for `expected_items` with the given
    /// target `false_positive_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `expected_items` is 0 or `false_positive_rate` is not in `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        // m = -n * ln(p) / (ln(2)^2)
        let n = expected_items as f64;
        let m = (-n * false_positive_rate.ln() / (std::f64::consts::LN_2.powi(2))).ceil() as u64;
        let m = m.max(64);

        // k = (m/n) * ln(2)
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.clamp(1, 16);

        let byte_len = m.div_ceil(8) as usize;

        Self {
            bits: vec![0u8; byte_len],
            num_bits: m,
            num_hashes: k,
            items: 0,
        }
    }

    /// Adds a stream hash to the set.
    pub fn insert(&mut self, hash: u64) {
        let (h1, h2) = probe_pair(hash);
        for i in 0..self.num_hashes {
            let bit_idx = self.bit_index(h1, h2, i);
            self.set_bit(bit_idx);
        }
        self.items += 1;
    }

    /// Returns `false` only if `hash` was definitely never inserted.
    #[must_use]
    pub fn may_contain(&self, hash: u64) -> bool {
        let (h1, h2) = probe_pair(hash);
        (0..self.num_hashes).all(|i| self.get_bit(self.bit_index(h1, h2, i)))
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Number of [`insert`](Self::insert) calls, duplicates included.
    #[must_use]
    pub fn items(&self) -> u64 {
        self.items
    }

    /// Serializes the filter (magic, checksum, body) to `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let body = self.body_bytes();
        let mut hasher = Crc32::new();
        hasher.update(&body);

        w.write_u32::<LittleEndian>(BLOOM_MAGIC)?;
        w.write_u32::<LittleEndian>(hasher.finalize())?;
        w.write_all(&body)?;
        Ok(())
    }

    /// Deserializes a filter written by [`write_to`](Self::write_to).
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != BLOOM_MAGIC {
            return Err(invalid(format!("bad bloom magic {:#010x}", magic)));
        }
        let stored_crc = r.read_u32::<LittleEndian>()?;

        let num_bits = r.read_u64::<LittleEndian>()?;
        let num_hashes = r.read_u32::<LittleEndian>()?;
        let items = r.read_u64::<LittleEndian>()?;
        let bits_len = r.read_u32::<LittleEndian>()? as usize;

        if bits_len > MAX_BLOOM_BYTES {
            return Err(invalid(format!("bloom filter too large: {} bytes", bits_len)));
        }
        if num_bits == 0 || num_bits > (bits_len as u64) * 8 || num_hashes == 0 {
            return Err(invalid("inconsistent bloom filter dimensions".to_string()));
        }

        let mut bits = vec![0u8; bits_len];
        r.read_exact(&mut bits)?;

        let filter = Self {
            bits,
            num_bits,
            num_hashes,
            items,
        };
        let mut hasher = Crc32::new();
        hasher.update(&filter.body_bytes());
        if hasher.finalize() != stored_crc {
            return Err(invalid("bloom filter checksum mismatch".to_string()));
        }
        Ok(filter)
    }

    /// Writes the filter to `path` via a temp file and atomic rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let tmp_path = path.with_extension("bloom.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut w = BufWriter::new(file);
            self.write_to(&mut w)?;
            w.flush()?;
            w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&tmp_path, path)
    }

    /// Loads a filter previously written with [`save`](Self::save).
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read_from(&mut r)
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(24 + self.bits.len());
        body.extend_from_slice(&self.num_bits.to_le_bytes());
        body.extend_from_slice(&self.num_hashes.to_le_bytes());
        body.extend_from_slice(&self.items.to_le_bytes());
        body.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        body.extend_from_slice(&self.bits);
        body
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    fn set_bit(&mut self, idx: u64) {
        let byte_idx = (idx / 8) as usize;
        let bit_offset = (idx % 8) as u8;
        self.bits[byte_idx] |= 1 << bit_offset;
    }

    fn get_bit(&self, idx: u64) -> bool {
        let byte_idx = (idx / 8) as usize;
        let bit_offset = (idx % 8) as u8;
        (self.bits[byte_idx] >> bit_offset) & 1 == 1
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("items", &self.items)
            .field("bytes", &self.bits.len())
            .finish()
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Derives two probe bases from a stream hash. `h2` is forced odd so the
/// probe sequence never collapses onto a single bit.
fn probe_pair(hash: u64) -> (u64, u64) {
    let h1 = splitmix64(hash ^ 0x9e37_79b9_7f4a_7c15);
    let h2 = splitmix64(hash.rotate_left(32) ^ 0xc2b2_ae3d_27d4_eb4f) | 1;
    (h1, h2)
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
