use bytes::Bytes;

/// Per-table membership oracle over 32-bit key fingerprints.
///
/// Double hashing: one fingerprint is stepped by its own rotation to
/// derive the probe sequence, so a single u32 per key is enough.
pub struct Bloom {
    filter: Bytes,
    k: u8,
}

impl Bloom {
    /// Bits per key needed for the wanted false positive rate.
    pub fn bloom_bits_per_key(entries: usize, false_positive_rate: f64) -> usize {
        let entries = entries.max(1) as f64;
        let size = -1.0 * entries * false_positive_rate.ln() / std::f64::consts::LN_2.powi(2);
        (size / entries).ceil() as usize
    }

    pub fn build_from_key_hashes(keys: &[u32], bits_per_key: usize) -> Bloom {
        let k = ((bits_per_key as f64 * 0.69) as u32).clamp(1, 30);
        let nbits = (keys.len() * bits_per_key).max(64);
        let nbytes = (nbits + 7) / 8;
        let nbits = nbytes * 8;
        let mut filter = vec![0u8; nbytes];
        for h in keys {
            let mut h = *h;
            let delta = h.rotate_left(15);
            for _ in 0..k {
                let pos = (h as usize) % nbits;
                filter[pos / 8] |= 1 << (pos % 8);
                h = h.wrapping_add(delta);
            }
        }
        Bloom {
            filter: filter.into(),
            k: k as u8,
        }
    }

    pub fn may_contain(&self, h: u32) -> bool {
        if self.k > 30 {
            return true;
        }
        let nbits = self.filter.len() * 8;
        let mut h = h;
        let delta = h.rotate_left(15);
        for _ in 0..self.k {
            let pos = (h as usize) % nbits;
            if self.filter[pos / 8] & (1 << (pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}
