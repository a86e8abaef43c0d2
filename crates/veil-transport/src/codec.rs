//! Datagram framing and encryption.
//!
//! With a cipher present every datagram on the wire is
//!
//! ```text
//! +----------------+-----------+------------------+
//! | nonce (16, rnd) | crc32 (4) | KCP segment(s)  |
//! +----------------+-----------+------------------+
//! ```
//!
//! encrypted as a whole. The CRC (IEEE, little-endian) covers the KCP
//! bytes and doubles as the integrity check after decryption. Without a
//! cipher the KCP bytes travel bare.

use veil_crypto::CipherInstance;
use veil_crypto::random::fill_random;

use crate::transport::TransportResult;

/// Random prefix that randomizes the cipher chain.
pub const NONCE_SIZE: usize = 16;

/// Checksum following the nonce.
pub const CRC_SIZE: usize = 4;

/// Bytes added in front of the KCP payload when encrypting.
pub const CRYPT_HEADER_SIZE: usize = NONCE_SIZE + CRC_SIZE;

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320)
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = CRC_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

/// Encrypts and frames outbound datagrams, checks and strips inbound ones.
///
/// Cheap to clone: the cipher is shared.
#[derive(Clone, Default)]
pub struct DatagramCodec {
    crypt: Option<CipherInstance>,
}

impl DatagramCodec {
    /// Codec for `crypt`; `None` sends KCP bytes in the clear.
    #[must_use]
    pub fn new(crypt: Option<CipherInstance>) -> Self {
        Self { crypt }
    }

    /// Bytes this codec adds to every datagram.
    #[must_use]
    pub fn overhead(&self) -> usize {
        if self.crypt.is_some() {
            CRYPT_HEADER_SIZE
        } else {
            0
        }
    }

    /// Name of the suite in use, or `"null"`.
    #[must_use]
    pub fn suite_name(&self) -> &'static str {
        self.crypt.as_ref().map_or("null", |c| c.suite().name())
    }

    /// Frame and encrypt one KCP payload.
    ///
    /// # Errors
    /// Fails only if the OS random source fails.
    pub fn encode(&self, payload: &[u8]) -> TransportResult<Vec<u8>> {
        let Some(crypt) = &self.crypt else {
            return Ok(payload.to_vec());
        };
        let mut datagram = vec![0u8; CRYPT_HEADER_SIZE + payload.len()];
        fill_random(&mut datagram[..NONCE_SIZE])?;
        datagram[NONCE_SIZE..CRYPT_HEADER_SIZE].copy_from_slice(&crc32(payload).to_le_bytes());
        datagram[CRYPT_HEADER_SIZE..].copy_from_slice(payload);
        crypt.encrypt(&mut datagram);
        Ok(datagram)
    }

    /// Decrypt `datagram` in place and return its KCP payload.
    ///
    /// Returns `None` for datagrams that are too short or fail the CRC,
    /// which is what foreign traffic and wrong-key peers produce.
    pub fn decode<'a>(&self, datagram: &'a mut [u8]) -> Option<&'a [u8]> {
        let Some(crypt) = &self.crypt else {
            return Some(&*datagram);
        };
        if datagram.len() < CRYPT_HEADER_SIZE {
            return None;
        }
        crypt.decrypt(datagram);
        let stored = u32::from_le_bytes([
            datagram[NONCE_SIZE],
            datagram[NONCE_SIZE + 1],
            datagram[NONCE_SIZE + 2],
            datagram[NONCE_SIZE + 3],
        ]);
        let payload = &datagram[CRYPT_HEADER_SIZE..];
        (crc32(payload) == stored).then_some(payload)
    }
}

impl std::fmt::Debug for DatagramCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramCodec")
            .field("suite", &self.suite_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_crypto::resolve;

    fn codec(suite: &str) -> DatagramCodec {
        DatagramCodec::new(resolve("codec-seed", suite).unwrap())
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_null_codec_is_transparent() {
        let codec = codec("null");
        assert_eq!(codec.overhead(), 0);
        let mut wire = codec.encode(b"segment").unwrap();
        assert_eq!(wire, b"segment");
        assert_eq!(codec.decode(&mut wire).unwrap(), b"segment");
    }

    #[test]
    fn test_encrypted_frame() {
        let codec = codec("aes-128");
        assert_eq!(codec.overhead(), CRYPT_HEADER_SIZE);
        let payload = b"a kcp segment with some body";
        let mut wire = codec.encode(payload).unwrap();
        assert_eq!(wire.len(), payload.len() + CRYPT_HEADER_SIZE);
        assert!(!wire.windows(payload.len()).any(|w| w == payload));
        assert_eq!(codec.decode(&mut wire).unwrap(), payload);
    }

    #[test]
    fn test_nonce_randomizes_ciphertext() {
        let codec = codec("sm4");
        let a = codec.encode(b"same payload").unwrap();
        let b = codec.encode(b"same payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_none_suite_frames_in_clear() {
        let codec = codec("none");
        let wire = codec.encode(b"visible").unwrap();
        assert_eq!(&wire[CRYPT_HEADER_SIZE..], b"visible");
        assert_eq!(
            u32::from_le_bytes(wire[NONCE_SIZE..CRYPT_HEADER_SIZE].try_into().unwrap()),
            crc32(b"visible")
        );
    }

    #[test]
    fn test_corruption_rejected() {
        let codec = codec("salsa20");
        let mut wire = codec.encode(b"payload").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(codec.decode(&mut wire).is_none());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sender = DatagramCodec::new(resolve("key-one", "aes-256").unwrap());
        let receiver = DatagramCodec::new(resolve("key-two", "aes-256").unwrap());
        let mut wire = sender.encode(&[7u8; 64]).unwrap();
        assert!(receiver.decode(&mut wire).is_none());
    }

    #[test]
    fn test_short_datagram_rejected() {
        let codec = codec("xor");
        let mut runt = [0u8; CRYPT_HEADER_SIZE - 1];
        assert!(codec.decode(&mut runt).is_none());
    }

    #[test]
    fn test_every_suite_frames() {
        for &suite in veil_crypto::CipherSuite::all() {
            let codec = codec(suite.name());
            let mut wire = codec.encode(b"x").unwrap();
            assert_eq!(codec.decode(&mut wire).unwrap(), b"x", "suite {suite}");
        }
    }
}
