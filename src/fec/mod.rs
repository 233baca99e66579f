//! Reed-Solomon FEC groups for the striped transport.
//!
//! Packets queued for striping are framed as `[len: u16 BE][payload]`,
//! zero-padded to the longest shard in the group, and encoded as K data +
//! M parity shards over GF(2^8). Any K of the K+M shards reconstruct the
//! group. Partial groups (flushed before K packets accumulated) bypass FEC
//! entirely and are delivered shard-by-shard.

use std::time::{Duration, Instant};

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};

/// Incomplete receive groups older than this are swept, delivering whatever
/// data shards they already hold.
pub const GROUP_TTL: Duration = Duration::from_secs(2);

/// FEC encoder shared by all groups of a session. `None` codec means M = 0:
/// striping without parity.
pub struct FecEncoder {
    data_shards: usize,
    parity_shards: usize,
    codec: Option<ReedSolomon>,
}

impl FecEncoder {
    /// Create an encoder for K data + M parity shards.
    /// K must be in 1..=255 and M in 0..=255-K.
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || data_shards > 255 {
            return Err(Error::Fec(format!(
                "data shards must be 1..=255, got {data_shards}"
            )));
        }
        if parity_shards > 255 - data_shards {
            return Err(Error::Fec(format!(
                "parity shards must be 0..={}, got {parity_shards}",
                255 - data_shards
            )));
        }
        let codec = if parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards)
                    .map_err(|e| Error::Fec(format!("codec init: {e:?}")))?,
            )
        } else {
            None
        };
        Ok(Self {
            data_shards,
            parity_shards,
            codec,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// Whether parity is configured at all.
    pub fn has_parity(&self) -> bool {
        self.codec.is_some()
    }

    /// Pad data shards to equal length and compute parity shards.
    ///
    /// Returns `(padded_data, parity)`. Parity is empty unless the group is
    /// full (exactly K shards) and parity is configured; partial groups are
    /// sent without protection.
    pub fn encode_group(&self, shards: &[Vec<u8>]) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let max_len = shards.iter().map(Vec::len).max().unwrap_or(0);
        let padded: Vec<Vec<u8>> = shards
            .iter()
            .map(|s| {
                let mut p = s.clone();
                p.resize(max_len, 0);
                p
            })
            .collect();

        let Some(codec) = &self.codec else {
            return Ok((padded, Vec::new()));
        };
        if padded.len() != self.data_shards {
            return Ok((padded, Vec::new()));
        }

        let mut all = padded.clone();
        all.resize(self.data_shards + self.parity_shards, vec![0u8; max_len]);
        codec
            .encode(&mut all)
            .map_err(|e| Error::Fec(format!("encode: {e:?}")))?;
        let parity = all.split_off(self.data_shards);
        Ok((padded, parity))
    }

    /// Reconstruct all shards of a group in place. Present shards must be
    /// padded to a common length beforehand.
    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let codec = self
            .codec
            .as_ref()
            .ok_or_else(|| Error::Fec("reconstruct without parity".into()))?;
        codec
            .reconstruct(shards)
            .map_err(|e| Error::Fec(format!("reconstruct: {e:?}")))
    }
}

/// Frame a packet as a shard payload: 2-byte big-endian length prefix.
pub fn frame_shard(pkt: &[u8]) -> Vec<u8> {
    let mut shard = Vec::with_capacity(2 + pkt.len());
    shard.extend_from_slice(&(pkt.len() as u16).to_be_bytes());
    shard.extend_from_slice(pkt);
    shard
}

/// Recover the packet from a (possibly padded) shard payload.
pub fn unframe_shard(shard: &[u8]) -> Option<Vec<u8>> {
    if shard.len() < 2 {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([shard[0], shard[1]]));
    if len == 0 || shard.len() < 2 + len {
        return None;
    }
    Some(shard[2..2 + len].to_vec())
}

/// A receive-side FEC group accumulating shards until decodable.
pub struct FecGroup {
    data_shards: usize,
    shards: Vec<Option<Vec<u8>>>,
    received: usize,
    max_len: usize,
    created: Instant,
    delivered: bool,
}

impl FecGroup {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        Self {
            data_shards,
            shards: vec![None; data_shards + parity_shards],
            received: 0,
            max_len: 0,
            created: Instant::now(),
            delivered: false,
        }
    }

    /// Store a received shard. Duplicate and out-of-range indices are
    /// ignored. Returns true once K shards are present.
    pub fn add_shard(&mut self, idx: usize, data: &[u8]) -> bool {
        if idx < self.shards.len() && self.shards[idx].is_none() {
            self.max_len = self.max_len.max(data.len());
            self.shards[idx] = Some(data.to_vec());
            self.received += 1;
        }
        self.decodable()
    }

    pub fn decodable(&self) -> bool {
        self.received >= self.data_shards
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn delivered(&self) -> bool {
        self.delivered
    }

    /// Mark the group delivered; returns false if it already was. Guards
    /// against double delivery when decode and GC race.
    pub fn mark_delivered(&mut self) -> bool {
        if self.delivered {
            return false;
        }
        self.delivered = true;
        true
    }

    fn all_data_present(&self) -> bool {
        self.shards[..self.data_shards].iter().all(Option::is_some)
    }

    /// Decode the group into its packets, reconstructing missing data
    /// shards if necessary. Returns `(packets, recovered)` where
    /// `recovered` is true when FEC reconstruction ran.
    pub fn decode(&mut self, encoder: &FecEncoder) -> Result<(Vec<Vec<u8>>, bool)> {
        if self.all_data_present() {
            return Ok((self.extract_packets(), false));
        }

        // Pad present shards to the group maximum before reconstruction.
        for shard in self.shards.iter_mut().flatten() {
            if shard.len() < self.max_len {
                shard.resize(self.max_len, 0);
            }
        }
        encoder.reconstruct(&mut self.shards)?;
        Ok((self.extract_packets(), true))
    }

    /// Packets from whatever data shards are present, with no
    /// reconstruction. Used by the GC sweep and for parity-less groups.
    pub fn extract_packets(&self) -> Vec<Vec<u8>> {
        self.shards[..self.data_shards]
            .iter()
            .flatten()
            .filter_map(|s| unframe_shard(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| {
                let mut p = vec![0x45u8; 20 + i * 7];
                p[1] = i as u8;
                p
            })
            .collect()
    }

    fn encode(enc: &FecEncoder, pkts: &[Vec<u8>]) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let shards: Vec<Vec<u8>> = pkts.iter().map(|p| frame_shard(p)).collect();
        enc.encode_group(&shards).unwrap()
    }

    #[test]
    fn parameter_validation() {
        assert!(FecEncoder::new(0, 2).is_err());
        assert!(FecEncoder::new(256, 0).is_err());
        assert!(FecEncoder::new(200, 56).is_err());
        assert!(FecEncoder::new(255, 0).is_ok());
        assert!(FecEncoder::new(4, 2).is_ok());
    }

    #[test]
    fn shard_framing_round_trip() {
        let pkt = vec![1u8, 2, 3, 4, 5];
        let mut shard = frame_shard(&pkt);
        shard.resize(32, 0); // padding survives
        assert_eq!(unframe_shard(&shard).unwrap(), pkt);
    }

    #[test]
    fn unframe_rejects_garbage() {
        assert!(unframe_shard(&[]).is_none());
        assert!(unframe_shard(&[0]).is_none());
        assert!(unframe_shard(&[0, 0, 1]).is_none()); // zero length
        assert!(unframe_shard(&[0, 9, 1, 2]).is_none()); // truncated
    }

    #[test]
    fn any_k_of_n_shards_decode() {
        let enc = FecEncoder::new(4, 2).unwrap();
        let pkts = packets(4);
        let (data, parity) = encode(&enc, &pkts);
        assert_eq!(parity.len(), 2);

        // Drop data shards 1 and 3, keep both parity shards.
        let mut group = FecGroup::new(4, 2);
        assert!(!group.add_shard(0, &data[0]));
        assert!(!group.add_shard(2, &data[2]));
        assert!(!group.add_shard(4, &parity[0]));
        assert!(group.add_shard(5, &parity[1]));

        let (decoded, recovered) = group.decode(&enc).unwrap();
        assert!(recovered);
        assert_eq!(decoded, pkts);
    }

    #[test]
    fn k_minus_one_shards_not_decodable() {
        let enc = FecEncoder::new(4, 2).unwrap();
        let (data, parity) = encode(&enc, &packets(4));

        let mut group = FecGroup::new(4, 2);
        group.add_shard(0, &data[0]);
        group.add_shard(1, &data[1]);
        group.add_shard(4, &parity[0]);
        assert!(!group.decodable());
    }

    #[test]
    fn all_data_present_skips_reconstruction() {
        let enc = FecEncoder::new(3, 1).unwrap();
        let pkts = packets(3);
        let (data, _) = encode(&enc, &pkts);

        let mut group = FecGroup::new(3, 1);
        for (i, shard) in data.iter().enumerate() {
            group.add_shard(i, shard);
        }
        let (decoded, recovered) = group.decode(&enc).unwrap();
        assert!(!recovered);
        assert_eq!(decoded, pkts);
    }

    #[test]
    fn duplicate_shard_ignored() {
        let mut group = FecGroup::new(2, 1);
        group.add_shard(0, &frame_shard(&[1, 2, 3]));
        group.add_shard(0, &frame_shard(&[9, 9, 9]));
        assert_eq!(group.received(), 1);
    }

    #[test]
    fn out_of_range_shard_ignored() {
        let mut group = FecGroup::new(2, 1);
        group.add_shard(3, &frame_shard(&[1])); // beyond K+M-1
        group.add_shard(200, &frame_shard(&[1]));
        assert_eq!(group.received(), 0);
    }

    #[test]
    fn partial_extraction_returns_present_data() {
        let enc = FecEncoder::new(4, 2).unwrap();
        let pkts = packets(4);
        let (data, _) = encode(&enc, &pkts);

        let mut group = FecGroup::new(4, 2);
        group.add_shard(0, &data[0]);
        group.add_shard(2, &data[2]);
        let extracted = group.extract_packets();
        assert_eq!(extracted, vec![pkts[0].clone(), pkts[2].clone()]);
    }

    #[test]
    fn delivered_flag_is_one_shot() {
        let mut group = FecGroup::new(2, 0);
        assert!(group.mark_delivered());
        assert!(!group.mark_delivered());
    }

    #[test]
    fn partial_group_gets_no_parity() {
        let enc = FecEncoder::new(4, 2).unwrap();
        let (data, parity) = encode(&enc, &packets(2)); // fewer than K
        assert_eq!(data.len(), 2);
        assert!(parity.is_empty());
    }

    #[test]
    fn no_parity_encoder_pads_only() {
        let enc = FecEncoder::new(4, 0).unwrap();
        assert!(!enc.has_parity());
        let (data, parity) = encode(&enc, &packets(4));
        assert!(parity.is_empty());
        let max = data.iter().map(Vec::len).max().unwrap();
        assert!(data.iter().all(|s| s.len() == max));
    }
}
