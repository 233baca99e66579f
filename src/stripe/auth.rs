//! Authentication trailer and replay protection for striped pipes.
//!
//! Stripe packets are plaintext UDP; when a shared key is configured every
//! packet carries a trailer `[seq: u64 BE][tag: 16 bytes]`. The tag is
//! HMAC-SHA256 over `session_id ‖ epoch ‖ seq ‖ packet`, truncated to 16
//! bytes, where `epoch = unix_time / rekey_interval`. The verifier accepts
//! the current and previous epoch to tolerate clock skew around rollover.
//!
//! Replay protection is a per-session sliding window over sequence numbers:
//! a value is accepted at most once, and values older than the window are
//! rejected outright.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Truncated tag length.
pub const TAG_LEN: usize = 16;

/// Full trailer length: sequence number plus tag.
pub const TRAILER_LEN: usize = 8 + TAG_LEN;

/// Default key rotation interval.
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(3600);

/// Number of sequence values the replay window tracks.
pub const REPLAY_WINDOW: u64 = 1024;

/// Parse a configured auth key. Accepts `hex:`-prefixed, `base64:`-prefixed
/// or raw string keys.
pub fn parse_key(value: &str) -> Result<Vec<u8>> {
    if let Some(hex_key) = value.strip_prefix("hex:") {
        return hex::decode(hex_key)
            .map_err(|e| Error::InvalidConfig(format!("stripe_auth_key: bad hex: {e}")));
    }
    if let Some(b64_key) = value.strip_prefix("base64:") {
        return base64::engine::general_purpose::STANDARD
            .decode(b64_key)
            .map_err(|e| Error::InvalidConfig(format!("stripe_auth_key: bad base64: {e}")));
    }
    if value.is_empty() {
        return Err(Error::InvalidConfig("stripe_auth_key is empty".into()));
    }
    Ok(value.as_bytes().to_vec())
}

/// Signs and verifies stripe packet trailers.
#[derive(Clone)]
pub struct StripeAuth {
    key: Vec<u8>,
    rekey_interval: Duration,
}

impl StripeAuth {
    pub fn new(key: Vec<u8>, rekey_interval: Duration) -> Self {
        Self {
            key,
            rekey_interval: if rekey_interval.is_zero() {
                DEFAULT_REKEY_INTERVAL
            } else {
                rekey_interval
            },
        }
    }

    pub fn from_config(value: &str, rekey_interval: Duration) -> Result<Self> {
        Ok(Self::new(parse_key(value)?, rekey_interval))
    }

    fn current_epoch(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now / self.rekey_interval.as_secs().max(1)
    }

    fn tag(&self, session_id: u32, epoch: u64, seq: u64, body: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&session_id.to_be_bytes());
        mac.update(&epoch.to_be_bytes());
        mac.update(&seq.to_be_bytes());
        mac.update(body);
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        tag
    }

    /// Append a trailer for `seq` to a wire packet.
    pub fn seal(&self, session_id: u32, seq: u64, packet: &mut Vec<u8>) {
        let tag = self.tag(session_id, self.current_epoch(), seq, packet);
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&tag);
    }

    /// Verify and strip the trailer. Returns the sequence number and the
    /// authenticated body length on success.
    pub fn open(&self, session_id: u32, packet: &[u8]) -> Result<(u64, usize)> {
        if packet.len() < TRAILER_LEN {
            return Err(Error::Authentication("packet shorter than trailer".into()));
        }
        let body_len = packet.len() - TRAILER_LEN;
        let body = &packet[..body_len];
        let seq = u64::from_be_bytes(packet[body_len..body_len + 8].try_into().unwrap());
        let tag = &packet[body_len + 8..];

        let epoch = self.current_epoch();
        // Accept the previous epoch as well so packets in flight across a
        // rollover still verify.
        for candidate in [epoch, epoch.saturating_sub(1)] {
            if self.verify_epoch(session_id, candidate, seq, body, tag) {
                return Ok((seq, body_len));
            }
        }
        Err(Error::Authentication("trailer mismatch".into()))
    }

    fn verify_epoch(&self, session_id: u32, epoch: u64, seq: u64, body: &[u8], tag: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&session_id.to_be_bytes());
        mac.update(&epoch.to_be_bytes());
        mac.update(&seq.to_be_bytes());
        mac.update(body);
        mac.verify_truncated_left(tag).is_ok()
    }
}

impl std::fmt::Debug for StripeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeAuth")
            .field("key_len", &self.key.len())
            .field("rekey_interval", &self.rekey_interval)
            .finish()
    }
}

/// Sliding replay window over sequence numbers.
#[derive(Debug)]
pub struct ReplayWindow {
    seen: HashSet<u64>,
    max_seq: u64,
    window: u64,
    primed: bool,
}

impl ReplayWindow {
    pub fn new(window: u64) -> Self {
        Self {
            seen: HashSet::new(),
            max_seq: 0,
            window: window.max(1),
            primed: false,
        }
    }

    /// Accept `seq` if it is fresh, registering it. Returns false for
    /// duplicates and for values older than the window.
    pub fn check_and_register(&mut self, seq: u64) -> bool {
        if self.primed && seq + self.window <= self.max_seq {
            return false; // older than the window
        }
        if !self.seen.insert(seq) {
            return false; // duplicate
        }

        if !self.primed || seq > self.max_seq {
            self.max_seq = seq;
            self.primed = true;
            // Drop entries that slid out of the window.
            let (max, window) = (self.max_seq, self.window);
            self.seen.retain(|&s| s + window > max);
        }
        true
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> StripeAuth {
        StripeAuth::new(b"shared-secret".to_vec(), DEFAULT_REKEY_INTERVAL)
    }

    #[test]
    fn key_parsing() {
        assert_eq!(parse_key("secret").unwrap(), b"secret");
        assert_eq!(parse_key("hex:deadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            parse_key("base64:aGVsbG8=").unwrap(),
            b"hello".to_vec()
        );
        assert!(parse_key("hex:zz").is_err());
        assert!(parse_key("base64:!!").is_err());
        assert!(parse_key("").is_err());
    }

    #[test]
    fn seal_open_round_trip() {
        let auth = auth();
        let mut pkt = b"some stripe packet".to_vec();
        let body_len = pkt.len();
        auth.seal(0x1234, 7, &mut pkt);
        assert_eq!(pkt.len(), body_len + TRAILER_LEN);

        let (seq, opened_len) = auth.open(0x1234, &pkt).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(opened_len, body_len);
    }

    #[test]
    fn tamper_any_byte_fails() {
        let auth = auth();
        let mut pkt = b"packet body bytes".to_vec();
        auth.seal(1, 1, &mut pkt);

        for i in 0..pkt.len() {
            let mut tampered = pkt.clone();
            tampered[i] ^= 0x01;
            assert!(
                auth.open(1, &tampered).is_err(),
                "flip at offset {i} must fail verification"
            );
        }
    }

    #[test]
    fn wrong_session_fails() {
        let auth = auth();
        let mut pkt = b"body".to_vec();
        auth.seal(1, 1, &mut pkt);
        assert!(auth.open(2, &pkt).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let a = auth();
        let b = StripeAuth::new(b"other-secret".to_vec(), DEFAULT_REKEY_INTERVAL);
        let mut pkt = b"body".to_vec();
        a.seal(1, 1, &mut pkt);
        assert!(b.open(1, &pkt).is_err());
    }

    #[test]
    fn short_packet_fails() {
        assert!(auth().open(1, &[0u8; TRAILER_LEN - 1]).is_err());
    }

    #[test]
    fn replay_window_accepts_once() {
        let mut win = ReplayWindow::new(64);
        assert!(win.check_and_register(5));
        assert!(!win.check_and_register(5));
        assert!(win.check_and_register(6));
        assert!(!win.check_and_register(6));
    }

    #[test]
    fn replay_window_rejects_ancient() {
        let mut win = ReplayWindow::new(64);
        assert!(win.check_and_register(1000));
        assert!(!win.check_and_register(1000 - 64), "at window edge");
        assert!(!win.check_and_register(100), "far below window");
        assert!(win.check_and_register(999), "inside window still fine");
    }

    #[test]
    fn replay_window_out_of_order_within_window() {
        let mut win = ReplayWindow::new(64);
        assert!(win.check_and_register(10));
        assert!(win.check_and_register(8));
        assert!(win.check_and_register(9));
        assert!(!win.check_and_register(8));
    }

    #[test]
    fn replay_window_zero_first() {
        let mut win = ReplayWindow::new(64);
        assert!(win.check_and_register(0));
        assert!(!win.check_and_register(0));
    }
}
