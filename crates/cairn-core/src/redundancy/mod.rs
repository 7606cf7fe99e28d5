use reed_solomon_erasure::galois_8::ReedSolomon;

use cairn_types::{CairnError, ContentHash, Result};

/// Systematic Reed-Solomon erasure coder for chunk payloads.
///
/// A payload is split into `data_parts` equal-size shards plus
/// `parity_parts` parity shards; any `data_parts` of the total suffice
/// to reconstruct the payload exactly. With `parity_parts == 0` the
/// coding degenerates to a single shard holding the whole payload.
pub struct RedundancyEncoder {
    data_parts: usize,
    parity_parts: usize,
    rs: Option<ReedSolomon>,
}

impl RedundancyEncoder {
    pub fn new(data_parts: usize, parity_parts: usize) -> Result<Self> {
        if parity_parts == 0 {
            // Single-shard mode, the configured data part count is moot.
            return Ok(Self {
                data_parts: 1,
                parity_parts: 0,
                rs: None,
            });
        }
        if data_parts == 0 {
            return Err(CairnError::RedundancyConfig(
                "data parts must be at least 1".into(),
            ));
        }
        if data_parts + parity_parts > 256 {
            return Err(CairnError::RedundancyConfig(format!(
                "total shard count {} exceeds the GF(2^8) limit of 256",
                data_parts + parity_parts
            )));
        }
        let rs = ReedSolomon::new(data_parts, parity_parts)
            .map_err(|e| CairnError::RedundancyConfig(e.to_string()))?;
        Ok(Self {
            data_parts,
            parity_parts,
            rs: Some(rs),
        })
    }

    pub fn data_parts(&self) -> usize {
        self.data_parts
    }

    pub fn parity_parts(&self) -> usize {
        self.parity_parts
    }

    pub fn total_parts(&self) -> usize {
        self.data_parts + self.parity_parts
    }

    /// Split a payload into data shards and compute parity shards.
    /// Data shards are zero-padded to equal length; callers must record
    /// the payload length to strip the padding on reconstruction.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let Some(rs) = &self.rs else {
            return Ok(vec![data.to_vec()]);
        };

        let shard_size = data.len().div_ceil(self.data_parts).max(1);
        let mut shards: Vec<Vec<u8>> =
            Vec::with_capacity(self.data_parts + self.parity_parts);
        for i in 0..self.data_parts {
            let start = (i * shard_size).min(data.len());
            let end = ((i + 1) * shard_size).min(data.len());
            let mut shard = data[start..end].to_vec();
            shard.resize(shard_size, 0);
            shards.push(shard);
        }
        shards.extend(std::iter::repeat_with(|| vec![0u8; shard_size]).take(self.parity_parts));

        rs.encode(&mut shards)
            .map_err(|e| CairnError::RedundancyConfig(e.to_string()))?;
        Ok(shards)
    }

    /// Rebuild the payload from at least `data_parts` of the shards.
    /// Missing shards are `None`; `original_len` strips the padding.
    /// `hash` identifies the chunk in the error on failure.
    pub fn reconstruct(
        &self,
        shards: &mut [Option<Vec<u8>>],
        original_len: usize,
        hash: ContentHash,
    ) -> Result<Vec<u8>> {
        let found = shards.iter().filter(|s| s.is_some()).count();
        if found < self.data_parts {
            return Err(CairnError::Reconstruction {
                hash,
                found,
                required: self.data_parts,
            });
        }

        let Some(rs) = &self.rs else {
            let mut payload = shards[0]
                .take()
                .ok_or(CairnError::Reconstruction {
                    hash,
                    found: 0,
                    required: 1,
                })?;
            payload.truncate(original_len);
            return Ok(payload);
        };

        if shards[..self.data_parts].iter().any(|s| s.is_none()) {
            rs.reconstruct_data(shards)
                .map_err(|_| CairnError::Reconstruction {
                    hash,
                    found,
                    required: self.data_parts,
                })?;
        }

        let shard_size = shards[0].as_ref().map(|s| s.len()).unwrap_or(0);
        let mut payload = Vec::with_capacity(self.data_parts * shard_size);
        for shard in shards.iter().take(self.data_parts) {
            match shard {
                Some(bytes) => payload.extend_from_slice(bytes),
                None => {
                    return Err(CairnError::Reconstruction {
                        hash,
                        found,
                        required: self.data_parts,
                    })
                }
            }
        }
        payload.truncate(original_len);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> ContentHash {
        ContentHash::digest(b"chunk")
    }

    #[test]
    fn zero_parity_is_a_single_shard() {
        let coder = RedundancyEncoder::new(5, 0).unwrap();
        assert_eq!(coder.data_parts(), 1);
        assert_eq!(coder.total_parts(), 1);

        let data = b"whole payload in one piece";
        let shards = coder.encode(data).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0], data);

        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        assert_eq!(coder.reconstruct(&mut opts, data.len(), hash()).unwrap(), data);
    }

    #[test]
    fn roundtrip_with_all_shards() {
        let coder = RedundancyEncoder::new(3, 2).unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let shards = coder.encode(&data).unwrap();
        assert_eq!(shards.len(), 5);

        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        assert_eq!(coder.reconstruct(&mut opts, data.len(), hash()).unwrap(), data);
    }

    #[test]
    fn tolerates_up_to_parity_losses() {
        let coder = RedundancyEncoder::new(3, 2).unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 256) as u8).collect();
        let shards = coder.encode(&data).unwrap();

        // Drop one data and one parity shard.
        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[1] = None;
        opts[4] = None;
        assert_eq!(coder.reconstruct(&mut opts, data.len(), hash()).unwrap(), data);
    }

    #[test]
    fn too_many_losses_reports_counts() {
        let coder = RedundancyEncoder::new(3, 2).unwrap();
        let data = vec![7u8; 300];
        let shards = coder.encode(&data).unwrap();

        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[0] = None;
        opts[1] = None;
        opts[2] = None;
        let err = coder.reconstruct(&mut opts, data.len(), hash()).unwrap_err();
        match err {
            CairnError::Reconstruction { found, required, .. } => {
                assert_eq!(found, 2);
                assert_eq!(required, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_invalid_configurations() {
        assert!(RedundancyEncoder::new(0, 1).is_err());
        assert!(RedundancyEncoder::new(250, 10).is_err());
    }

    #[test]
    fn payload_not_divisible_by_data_parts() {
        let coder = RedundancyEncoder::new(4, 1).unwrap();
        let data = b"thirteen byte".to_vec();
        let shards = coder.encode(&data).unwrap();
        assert!(shards.iter().all(|s| s.len() == shards[0].len()));

        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        opts[3] = None;
        assert_eq!(coder.reconstruct(&mut opts, data.len(), hash()).unwrap(), data);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let coder = RedundancyEncoder::new(2, 1).unwrap();
        let shards = coder.encode(&[]).unwrap();
        let mut opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        assert!(coder.reconstruct(&mut opts, 0, hash()).unwrap().is_empty());
    }
}
