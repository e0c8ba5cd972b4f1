use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};

/// Initialization vector length in bytes
pub const IV_LEN: usize = 16;

// Minimal-standard linear congruential generator parameters
const LCG_MULTIPLIER: u64 = 48271;
const LCG_MODULUS: u64 = 2_147_483_647;

/// Lcg is the deterministic generator both peers run over the cleartext
/// per-connection seed to agree on an initialization vector
struct Lcg(u32);

/// Lcg implementation block
impl Lcg {
    /// new seeds the generator; a state of zero is mapped to one
    fn new(seed: u32) -> Self {
        let state = (seed as u64 % LCG_MODULUS) as u32;
        Lcg(if state == 0 { 1 } else { state })
    }

    /// next advances the generator and returns the new state
    fn next(&mut self) -> u32 {
        self.0 = ((self.0 as u64 * LCG_MULTIPLIER) % LCG_MODULUS) as u32;
        self.0
    }
}

/// derive_iv expands a per-connection seed into a 16-byte initialization
/// vector: four generator draws, each written least-significant byte first
pub fn derive_iv(seed: u32) -> [u8; IV_LEN] {
    let mut lcg = Lcg::new(seed);
    let mut iv = [0u8; IV_LEN];
    for word in iv.chunks_exact_mut(4) {
        word.copy_from_slice(&lcg.next().to_le_bytes());
    }
    iv
}

/// CipherStage holds one AES-CFB128 keystream per traffic direction:
/// `encrypt` advances the server-to-client state, `decrypt` the
/// client-to-server state. Buffers must be submitted in arrival order
/// for their direction or the keystreams lose alignment
pub struct CipherStage {
    inner: AesCfb,
}

/// AES flavor selected by key length; each variant pairs the encrypting
/// and decrypting keystream states
enum AesCfb {
    Aes128 {
        enc: BufEncryptor<Aes128>,
        dec: BufDecryptor<Aes128>,
    },
    Aes192 {
        enc: BufEncryptor<Aes192>,
        dec: BufDecryptor<Aes192>,
    },
    Aes256 {
        enc: BufEncryptor<Aes256>,
        dec: BufDecryptor<Aes256>,
    },
}

/// CipherStage implementation block
impl CipherStage {
    /// new builds both direction states from the shared key and IV.
    /// Keys are zero-padded up to the next AES size and truncated
    /// beyond 32 bytes
    pub fn new(key: &[u8], iv: &[u8; IV_LEN]) -> Self {
        let inner = match key.len() {
            0..=16 => {
                let mut k = [0u8; 16];
                k[..key.len()].copy_from_slice(key);
                AesCfb::Aes128 {
                    enc: BufEncryptor::<Aes128>::new(&k.into(), &(*iv).into()),
                    dec: BufDecryptor::<Aes128>::new(&k.into(), &(*iv).into()),
                }
            }
            17..=24 => {
                let mut k = [0u8; 24];
                k[..key.len()].copy_from_slice(key);
                AesCfb::Aes192 {
                    enc: BufEncryptor::<Aes192>::new(&k.into(), &(*iv).into()),
                    dec: BufDecryptor::<Aes192>::new(&k.into(), &(*iv).into()),
                }
            }
            _ => {
                let mut k = [0u8; 32];
                let n = key.len().min(32);
                k[..n].copy_from_slice(&key[..n]);
                AesCfb::Aes256 {
                    enc: BufEncryptor::<Aes256>::new(&k.into(), &(*iv).into()),
                    dec: BufDecryptor::<Aes256>::new(&k.into(), &(*iv).into()),
                }
            }
        };

        Self { inner }
    }

    /// encrypt transforms a server-to-client buffer in place and returns it
    pub fn encrypt(&mut self, mut data: Vec<u8>) -> Vec<u8> {
        match &mut self.inner {
            AesCfb::Aes128 { enc, .. } => enc.encrypt(&mut data),
            AesCfb::Aes192 { enc, .. } => enc.encrypt(&mut data),
            AesCfb::Aes256 { enc, .. } => enc.encrypt(&mut data),
        }
        data
    }

    /// decrypt transforms a client-to-server buffer in place and returns it
    pub fn decrypt(&mut self, mut data: Vec<u8>) -> Vec<u8> {
        match &mut self.inner {
            AesCfb::Aes128 { dec, .. } => dec.decrypt(&mut data),
            AesCfb::Aes192 { dec, .. } => dec.decrypt(&mut data),
            AesCfb::Aes256 { dec, .. } => dec.decrypt(&mut data),
        }
        data
    }
}
