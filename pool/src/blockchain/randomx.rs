//! RandomX share verification
//!
//! Light mode only: a 256 MB cache per seed and no dataset. A VM is not
//! `Send`, so each runtime worker thread keeps its own, rebuilt when the
//! template seed changes (once per epoch).

use anyhow::{anyhow, Result};
use randomx_rs::{RandomXCache, RandomXFlag, RandomXVM};
use std::cell::RefCell;
use std::sync::{Arc, Once};

use super::codec::{KeccakHasher, PowHasher};

static LOG_FLAGS_ONCE: Once = Once::new();

thread_local! {
    static VM: RefCell<Option<(Vec<u8>, RandomXVM)>> = const { RefCell::new(None) };
}

fn flags() -> RandomXFlag {
    let flags = RandomXFlag::get_recommended_flags();
    LOG_FLAGS_ONCE.call_once(|| {
        let jit = if flags.contains(RandomXFlag::FLAG_JIT) { "+JIT" } else { "" };
        let aes = if flags.contains(RandomXFlag::FLAG_HARD_AES) { "+HARD_AES" } else { "" };
        tracing::info!("RandomX flags: 0x{:x} mode=LIGHT{}{}", flags.bits(), jit, aes);
    });
    flags
}

fn new_vm(seed: &[u8]) -> Result<RandomXVM> {
    let flags = flags();
    let cache = RandomXCache::new(flags, seed).map_err(|e| anyhow!("RandomX cache creation failed: {}", e))?;
    RandomXVM::new(flags, Some(cache), None).map_err(|e| anyhow!("RandomX VM creation failed: {}", e))
}

/// `rx/0` proof of work, keyed by the template's seed hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomXHasher;

impl PowHasher for RandomXHasher {
    fn hash(&self, blob: &[u8], seed: &[u8]) -> Result<[u8; 32]> {
        VM.with(|slot| {
            let mut slot = slot.borrow_mut();
            let stale = !matches!(slot.as_ref(), Some((key, _)) if key.as_slice() == seed);
            if stale {
                tracing::info!("Building RandomX VM for seed {}", hex::encode(seed));
                *slot = Some((seed.to_vec(), new_vm(seed)?));
            }
            let Some((_, vm)) = slot.as_ref() else {
                return Err(anyhow!("RandomX VM missing"));
            };

            let hash = vm
                .calculate_hash(blob)
                .map_err(|e| anyhow!("RandomX hash calculation failed: {}", e))?;
            if hash.len() < 32 {
                return Err(anyhow!("RandomX returned a short hash ({}B)", hash.len()));
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(&hash[..32]);
            Ok(out)
        })
    }
}

/// Share hasher for the configured `algo`.
pub fn pow_hasher(algo: &str) -> Result<Arc<dyn PowHasher>> {
    match algo.to_ascii_lowercase().as_str() {
        "rx/0" | "randomx" => Ok(Arc::new(RandomXHasher)),
        "keccak" => Ok(Arc::new(KeccakHasher)),
        other => Err(anyhow!("Unsupported algo '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algo_selects_hasher() {
        assert!(pow_hasher("rx/0").is_ok());
        assert!(pow_hasher("RandomX").is_ok());
        assert!(pow_hasher("keccak").is_ok());
        assert!(pow_hasher("cn/r").is_err());
    }

    #[test]
    fn randomx_hash_follows_seed() {
        let h = RandomXHasher;
        let a = h.hash(b"block-header", b"seed-a").unwrap();
        assert_eq!(a, h.hash(b"block-header", b"seed-a").unwrap());
        assert_ne!(a, h.hash(b"block-header-2", b"seed-a").unwrap());
        assert_ne!(a, h.hash(b"block-header", b"seed-b").unwrap());
    }
}
