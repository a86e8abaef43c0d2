//! Whole-datagram encryption.
//!
//! Every suite except `null` produces a [`BlockCrypt`] that transforms a
//! complete datagram in place. Block ciphers run in CFB mode from a fixed
//! initial vector; the transport prepends a random nonce so the chain
//! differs for every datagram even though the IV never changes.

use std::sync::Arc;

use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf::pbkdf2_sha1;
use crate::suite::CipherSuite;
use crate::tea::{Tea, Xtea};
use crate::XOR_PAD_SIZE;

/// Fixed CFB initial vector. Ciphers with 8-byte blocks use the first half.
const INITIAL_VECTOR: [u8; 16] = [
    167, 115, 79, 156, 18, 172, 27, 1, 164, 21, 242, 193, 252, 120, 230, 107,
];

const MAX_BLOCK: usize = 16;

const XOR_SALT: &[u8] = b"sH3CIVoF#rWLtJo6";
const XOR_ROUNDS: u32 = 32;

const SALSA_NONCE: usize = 8;

/// A cipher applied to whole datagrams.
///
/// `decrypt(encrypt(x)) == x` for every buffer length, including buffers
/// that are not a multiple of the block size.
pub trait BlockCrypt: Send + Sync {
    /// Encrypt `buf` in place.
    fn encrypt(&self, buf: &mut [u8]);

    /// Decrypt `buf` in place.
    fn decrypt(&self, buf: &mut [u8]);

    /// Suite this instance was built for.
    fn suite(&self) -> CipherSuite;
}

/// Shared handle to a cipher; one instance serves a listener and all of
/// its sessions.
pub type CipherInstance = Arc<dyn BlockCrypt>;

/// Forward direction of a block cipher, the only direction CFB needs.
trait BlockPrimitive: Send + Sync {
    fn block_size(&self) -> usize;
    fn encrypt_block(&self, block: &mut [u8]);
}

/// Adapter over any RustCrypto block cipher.
struct RustCrypto<C>(C);

impl<C> BlockPrimitive for RustCrypto<C>
where
    C: BlockEncrypt + Send + Sync,
{
    fn block_size(&self) -> usize {
        C::block_size()
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let n = C::block_size();
        self.0.encrypt_block(GenericArray::from_mut_slice(&mut block[..n]));
    }
}

impl BlockPrimitive for Tea {
    fn block_size(&self) -> usize {
        crate::tea::BLOCK_SIZE
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        Tea::encrypt_block(self, block);
    }
}

impl BlockPrimitive for Xtea {
    fn block_size(&self) -> usize {
        crate::tea::BLOCK_SIZE
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        Xtea::encrypt_block(self, block);
    }
}

fn xor_in_place(dst: &mut [u8], pad: &[u8]) {
    for (d, p) in dst.iter_mut().zip(pad) {
        *d ^= p;
    }
}

/// Block cipher in CFB mode with the fixed initial vector.
pub(crate) struct CfbCrypt {
    suite: CipherSuite,
    cipher: Box<dyn BlockPrimitive>,
}

impl CfbCrypt {
    /// Build from any RustCrypto block cipher.
    pub(crate) fn rustcrypto<C>(suite: CipherSuite, key: &[u8]) -> Result<Self, CryptoError>
    where
        C: BlockEncrypt + KeyInit + Send + Sync + 'static,
    {
        let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            suite: suite.name(),
            expected: suite.key_len(),
            actual: key.len(),
        })?;
        Ok(Self {
            suite,
            cipher: Box::new(RustCrypto(cipher)),
        })
    }

    pub(crate) fn tea(key: &[u8]) -> Result<Self, CryptoError> {
        let key = tea_key(CipherSuite::Tea, key)?;
        Ok(Self {
            suite: CipherSuite::Tea,
            cipher: Box::new(Tea::new(&key, Tea::SUITE_CYCLES)),
        })
    }

    pub(crate) fn xtea(key: &[u8]) -> Result<Self, CryptoError> {
        let key = tea_key(CipherSuite::Xtea, key)?;
        Ok(Self {
            suite: CipherSuite::Xtea,
            cipher: Box::new(Xtea::new(&key)),
        })
    }

    fn first_pad(&self, tbl: &mut [u8; MAX_BLOCK]) -> usize {
        let bs = self.cipher.block_size();
        tbl[..bs].copy_from_slice(&INITIAL_VECTOR[..bs]);
        self.cipher.encrypt_block(&mut tbl[..bs]);
        bs
    }
}

fn tea_key(suite: CipherSuite, key: &[u8]) -> Result<Zeroizing<[u8; 16]>, CryptoError> {
    let arr: [u8; 16] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        suite: suite.name(),
        expected: 16,
        actual: key.len(),
    })?;
    Ok(Zeroizing::new(arr))
}

impl BlockCrypt for CfbCrypt {
    fn encrypt(&self, buf: &mut [u8]) {
        let mut tbl = [0u8; MAX_BLOCK];
        let bs = self.first_pad(&mut tbl);
        let mut chunks = buf.chunks_exact_mut(bs);
        for chunk in &mut chunks {
            xor_in_place(chunk, &tbl[..bs]);
            tbl[..bs].copy_from_slice(chunk);
            self.cipher.encrypt_block(&mut tbl[..bs]);
        }
        xor_in_place(chunks.into_remainder(), &tbl[..bs]);
    }

    fn decrypt(&self, buf: &mut [u8]) {
        let mut tbl = [0u8; MAX_BLOCK];
        let bs = self.first_pad(&mut tbl);
        let mut next = [0u8; MAX_BLOCK];
        let mut chunks = buf.chunks_exact_mut(bs);
        for chunk in &mut chunks {
            next[..bs].copy_from_slice(chunk);
            self.cipher.encrypt_block(&mut next[..bs]);
            xor_in_place(chunk, &tbl[..bs]);
            tbl[..bs].copy_from_slice(&next[..bs]);
        }
        xor_in_place(chunks.into_remainder(), &tbl[..bs]);
    }

    fn suite(&self) -> CipherSuite {
        self.suite
    }
}

/// Salsa20 keyed per datagram by its first 8 bytes, which stay in clear.
pub(crate) struct Salsa20Crypt {
    key: Zeroizing<[u8; 32]>,
}

impl Salsa20Crypt {
    pub(crate) fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            suite: CipherSuite::Salsa20.name(),
            expected: 32,
            actual: key.len(),
        })?;
        Ok(Self {
            key: Zeroizing::new(arr),
        })
    }

    fn apply(&self, buf: &mut [u8]) {
        if buf.len() <= SALSA_NONCE {
            return;
        }
        let (nonce, body) = buf.split_at_mut(SALSA_NONCE);
        let mut cipher = Salsa20::new(
            GenericArray::from_slice(self.key.as_slice()),
            GenericArray::from_slice(nonce),
        );
        cipher.apply_keystream(body);
    }
}

impl BlockCrypt for Salsa20Crypt {
    fn encrypt(&self, buf: &mut [u8]) {
        self.apply(buf);
    }

    fn decrypt(&self, buf: &mut [u8]) {
        self.apply(buf);
    }

    fn suite(&self) -> CipherSuite {
        CipherSuite::Salsa20
    }
}

/// XOR against a pad stretched from the key. Obfuscation only.
pub(crate) struct XorCrypt {
    pad: Zeroizing<Vec<u8>>,
}

impl XorCrypt {
    pub(crate) fn new(key: &[u8]) -> Self {
        let mut pad = Zeroizing::new(vec![0u8; XOR_PAD_SIZE]);
        pbkdf2_sha1(key, XOR_SALT, XOR_ROUNDS, &mut pad);
        Self { pad }
    }

    fn apply(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(self.pad.len()) {
            xor_in_place(chunk, &self.pad);
        }
    }
}

impl BlockCrypt for XorCrypt {
    fn encrypt(&self, buf: &mut [u8]) {
        self.apply(buf);
    }

    fn decrypt(&self, buf: &mut [u8]) {
        self.apply(buf);
    }

    fn suite(&self) -> CipherSuite {
        CipherSuite::Xor
    }
}

/// Leaves datagrams untouched. Framing still applies.
pub(crate) struct NoneCrypt;

impl BlockCrypt for NoneCrypt {
    fn encrypt(&self, _buf: &mut [u8]) {}

    fn decrypt(&self, _buf: &mut [u8]) {}

    fn suite(&self) -> CipherSuite {
        CipherSuite::None
    }
}
