//! Composable byte-transform pipeline applied to client-facing traffic.
//!
//! A pipeline stacks at most two stages: an AES-CFB128 stream cipher and a
//! zlib layer wrapping it. Outbound buffers are deflated then encrypted;
//! inbound buffers are decrypted then inflated. Each direction carries its
//! own streaming state, so buffers must be submitted in arrival order for
//! their direction.

pub mod cipher;
pub mod zlib;

use crate::error::Result;
use cipher::CipherStage;
use zlib::ZlibStage;

/// Pipeline is the per-connection transform stack between the proxy and
/// its client
pub struct Pipeline {
    cipher: Option<CipherStage>,
    zlib: Option<ZlibStage>,
}

/// Pipeline implementation block
impl Pipeline {
    /// build evaluates the construction rule once per accepted connection:
    /// a non-empty key adds the cipher stage keyed by the seed-derived IV,
    /// the compression flag wraps it in a zlib stage, and neither yields
    /// no pipeline at all (passthrough)
    pub fn build(key: &[u8], seed: u32, compress: bool) -> Option<Self> {
        let cipher = if key.is_empty() {
            None
        } else {
            Some(CipherStage::new(key, &cipher::derive_iv(seed)))
        };
        let zlib = if compress { Some(ZlibStage::new()) } else { None };

        if cipher.is_none() && zlib.is_none() {
            None
        } else {
            Some(Self { cipher, zlib })
        }
    }

    /// encrypt transforms bytes headed from server to client
    pub fn encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>> {
        let data = match &mut self.zlib {
            Some(z) => z.compress(buf)?,
            None => buf.to_vec(),
        };
        Ok(match &mut self.cipher {
            Some(c) => c.encrypt(data),
            None => data,
        })
    }

    /// decrypt transforms bytes received from the client before they are
    /// interpreted or relayed
    pub fn decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>> {
        let data = match &mut self.cipher {
            Some(c) => c.decrypt(buf.to_vec()),
            None => buf.to_vec(),
        };
        match &mut self.zlib {
            Some(z) => z.decompress(&data),
            None => Ok(data),
        }
    }
}
