/// Block blob codec and proof-of-work hashing
///
/// The pool only needs four things from the block format: the network
/// prefix of a wallet address, a way to put a nonce into a template blob,
/// the hashing form of a blob, and a block id. `CryptonoteCodec` covers the
/// CryptoNote layout; other coins plug in their own `BlockCodec`.

use anyhow::{anyhow, Result};
use sha3::{Digest, Keccak256};

/// Byte offset of the 4-byte nonce in a CryptoNote block header.
pub const NONCE_OFFSET: usize = 39;

/// Bytes `7..39` of a template blob hold the previous block hash.
pub const PREV_HASH_RANGE: std::ops::Range<usize> = 7..39;

pub trait BlockCodec: Send + Sync {
    /// Network prefix of an address, `None` if it does not decode.
    fn address_prefix(&self, address: &str) -> Option<u64>;

    /// Full block with `nonce` written into the template blob.
    fn construct_block_blob(&self, template: &[u8], nonce: &[u8; 4]) -> Result<Vec<u8>>;

    /// Form of the block that the proof-of-work hash is computed over.
    fn convert_blob(&self, blob: &[u8]) -> Result<Vec<u8>>;

    fn block_id(&self, blob: &[u8]) -> Result<[u8; 32]>;
}

pub trait PowHasher: Send + Sync {
    fn hash(&self, blob: &[u8], seed: &[u8]) -> Result<[u8; 32]>;
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CryptonoteCodec;

impl BlockCodec for CryptonoteCodec {
    fn address_prefix(&self, address: &str) -> Option<u64> {
        let raw = base58::decode(address)?;
        if raw.len() < 4 + 1 {
            return None;
        }
        let (body, checksum) = raw.split_at(raw.len() - 4);
        if keccak256(body)[..4] != *checksum {
            return None;
        }
        let (prefix, _) = read_varint(body)?;
        Some(prefix)
    }

    fn construct_block_blob(&self, template: &[u8], nonce: &[u8; 4]) -> Result<Vec<u8>> {
        if template.len() < NONCE_OFFSET + 4 {
            return Err(anyhow!("template blob too short: {} bytes", template.len()));
        }
        let mut blob = template.to_vec();
        blob[NONCE_OFFSET..NONCE_OFFSET + 4].copy_from_slice(nonce);
        Ok(blob)
    }

    /// Header, Merkle root of the miner tx and block tx hashes, then the
    /// tx count.
    fn convert_blob(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let mut r = Reader::new(blob);
        r.varint()?; // major version
        r.varint()?; // minor version
        r.varint()?; // timestamp
        r.take(32)?;
        r.take(4)?;
        let header_end = r.pos;
        if header_end != NONCE_OFFSET + 4 {
            return Err(anyhow!("unexpected header size {}", header_end));
        }

        let mut hashes = vec![miner_tx_hash(&mut r)?];
        let tx_count = r.varint()?;
        for _ in 0..tx_count {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(r.take(32)?);
            hashes.push(hash);
        }
        if r.pos != blob.len() {
            return Err(anyhow!("{} trailing bytes after block", blob.len() - r.pos));
        }

        let mut out = blob[..header_end].to_vec();
        out.extend_from_slice(&tree_hash(&hashes));
        out.extend_from_slice(&write_varint(hashes.len() as u64));
        Ok(out)
    }

    fn block_id(&self, blob: &[u8]) -> Result<[u8; 32]> {
        let hashing = self.convert_blob(blob)?;
        let mut data = write_varint(hashing.len() as u64);
        data.extend_from_slice(&hashing);
        Ok(keccak256(&data))
    }
}

/// Keccak-256 over `seed || blob`, selected with `algo = "keccak"`.
/// Cheap enough for test networks and the test suite.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeccakHasher;

impl PowHasher for KeccakHasher {
    fn hash(&self, blob: &[u8], seed: &[u8]) -> Result<[u8; 32]> {
        let mut hasher = Keccak256::new();
        hasher.update(seed);
        hasher.update(blob);
        Ok(hasher.finalize().into())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        let Some(end) = end else {
            return Err(anyhow!("block blob truncated at byte {}", self.pos));
        };
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, used) =
            read_varint(&self.data[self.pos..]).ok_or_else(|| anyhow!("bad varint at byte {}", self.pos))?;
        self.pos += used;
        Ok(value)
    }
}

const TXIN_GEN: u8 = 0xff;
const TXOUT_KEY: u8 = 0x02;
const TXOUT_TAGGED_KEY: u8 = 0x03;

/// Walk the coinbase transaction and return its id. Version 1 ids hash the
/// whole transaction; later versions hash the prefix hash, the hash of the
/// (empty) ring signature base and a zero prunable hash.
fn miner_tx_hash(r: &mut Reader<'_>) -> Result<[u8; 32]> {
    let start = r.pos;
    let version = r.varint()?;
    r.varint()?; // unlock time

    for _ in 0..r.varint()? {
        match r.byte()? {
            TXIN_GEN => {
                r.varint()?;
            }
            tag => return Err(anyhow!("unexpected miner tx input type {:#04x}", tag)),
        }
    }
    for _ in 0..r.varint()? {
        r.varint()?; // amount
        match r.byte()? {
            TXOUT_KEY => {
                r.take(32)?;
            }
            TXOUT_TAGGED_KEY => {
                r.take(33)?;
            }
            tag => return Err(anyhow!("unexpected miner tx output type {:#04x}", tag)),
        }
    }
    let extra_len = r.varint()?;
    r.take(usize::try_from(extra_len)?)?;
    let prefix_end = r.pos;

    if version < 2 {
        return Ok(keccak256(&r.data[start..prefix_end]));
    }

    let rct_type = r.byte()?;
    if rct_type != 0 {
        return Err(anyhow!("miner tx carries ring signatures of type {}", rct_type));
    }
    let mut parts = Vec::with_capacity(96);
    parts.extend_from_slice(&keccak256(&r.data[start..prefix_end]));
    parts.extend_from_slice(&keccak256(&[rct_type]));
    parts.extend_from_slice(&[0u8; 32]);
    Ok(keccak256(&parts))
}

fn hash_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// CryptoNote Merkle root. Leaves beyond the largest power of two below the
/// count are folded pairwise first.
pub fn tree_hash(hashes: &[[u8; 32]]) -> [u8; 32] {
    match hashes.len() {
        0 => [0u8; 32],
        1 => hashes[0],
        2 => hash_pair(&hashes[0], &hashes[1]),
        count => {
            let cnt = count.next_power_of_two() >> 1;
            let direct = 2 * cnt - count;
            let mut level: Vec<[u8; 32]> = hashes[..direct].to_vec();
            level.extend(hashes[direct..].chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])));
            while level.len() > 2 {
                level = level.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
            }
            hash_pair(&level[0], &level[1])
        }
    }
}

/// LEB128 varint; returns the value and the number of bytes consumed.
pub fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in data.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

pub fn write_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out
}

/// CryptoNote base58: 8-byte blocks encoded as 11 characters, with a
/// shorter final block.
pub mod base58 {
    const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    const FULL_BLOCK: usize = 8;
    const FULL_ENCODED_BLOCK: usize = 11;
    /// Encoded length indexed by decoded length.
    const ENCODED_SIZES: [usize; 9] = [0, 2, 3, 5, 6, 7, 9, 10, 11];

    fn digit(c: u8) -> Option<u64> {
        ALPHABET.iter().position(|&a| a == c).map(|p| p as u64)
    }

    fn decode_block(block: &[u8], out: &mut Vec<u8>) -> Option<()> {
        let size = ENCODED_SIZES.iter().position(|&s| s == block.len())?;
        let mut num: u128 = 0;
        for &c in block {
            num = num * 58 + u128::from(digit(c)?);
        }
        if size < FULL_BLOCK && num >> (8 * size) != 0 {
            return None;
        }
        if num > u128::from(u64::MAX) {
            return None;
        }
        let bytes = (num as u64).to_be_bytes();
        out.extend_from_slice(&bytes[FULL_BLOCK - size..]);
        Some(())
    }

    pub fn decode(input: &str) -> Option<Vec<u8>> {
        let bytes = input.as_bytes();
        if bytes.is_empty() {
            return None;
        }
        let mut out = Vec::with_capacity(bytes.len() * FULL_BLOCK / FULL_ENCODED_BLOCK + FULL_BLOCK);
        for block in bytes.chunks(FULL_ENCODED_BLOCK) {
            decode_block(block, &mut out)?;
        }
        Some(out)
    }

    fn encode_block(block: &[u8], out: &mut Vec<u8>) {
        let mut num: u64 = 0;
        for &b in block {
            num = (num << 8) | u64::from(b);
        }
        let size = ENCODED_SIZES[block.len()];
        let mut chars = vec![ALPHABET[0]; size];
        for slot in chars.iter_mut().rev() {
            *slot = ALPHABET[(num % 58) as usize];
            num /= 58;
        }
        out.extend_from_slice(&chars);
    }

    pub fn encode(data: &[u8]) -> String {
        let mut out = Vec::with_capacity(data.len() * FULL_ENCODED_BLOCK / FULL_BLOCK + FULL_ENCODED_BLOCK);
        for block in data.chunks(FULL_BLOCK) {
            encode_block(block, &mut out);
        }
        out.into_iter().map(char::from).collect()
    }
}

/// Build a well-formed address for `prefix`. Used by tests and tooling.
pub fn encode_address(prefix: u64, spend_key: &[u8; 32], view_key: &[u8; 32]) -> String {
    let mut body = write_varint(prefix);
    body.extend_from_slice(spend_key);
    body.extend_from_slice(view_key);
    let checksum = keccak256(&body);
    body.extend_from_slice(&checksum[..4]);
    base58::encode(&body)
}
