use crate::error::{ParloError, Result};
use crate::packet::HEADER_LEN_STANDARD;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use bytes::BufMut;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use twofish::Twofish;

const PBKDF2_ITERATIONS: u32 = 10_000;
const IV_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type TwofishCbcEnc = cbc::Encryptor<Twofish>;
type TwofishCbcDec = cbc::Decryptor<Twofish>;

/// The cipher suites a peer pair can agree on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    AesCbc,
    TwofishCbc,
}

impl CipherMode {
    /// Parses a mode from its wire/config name. Unknown names are the
    /// `UnsupportedCipher` error rather than a panic - the name typically
    /// comes from configuration written by the peer operator.
    pub fn from_name(name: &str) -> Result<CipherMode> {
        match name.to_ascii_lowercase().as_str() {
            "aes-cbc" => Ok(CipherMode::AesCbc),
            "twofish-cbc" => Ok(CipherMode::TwofishCbc),
            _ => Err(ParloError::UnsupportedCipher(name.to_string())),
        }
    }

    fn key_len(&self) -> usize {
        match self {
            CipherMode::AesCbc => 16,
            CipherMode::TwofishCbc => 32,
        }
    }
}

/// Password-style encryption parameters. Key and IV are derived from
/// `key`/`salt` with PBKDF2-HMAC-SHA256; the peers must share both strings
/// and the mode out of band.
#[derive(Clone, Debug)]
pub struct EncryptionArgs {
    pub mode: CipherMode,
    pub key: String,
    pub salt: String,
}

impl EncryptionArgs {
    pub fn new(mode: CipherMode, key: impl Into<String>, salt: impl Into<String>) -> EncryptionArgs {
        EncryptionArgs {
            mode,
            key: key.into(),
            salt: salt.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.key.is_empty() || self.salt.is_empty() {
            return Err(ParloError::InvalidArgument("encryption key and salt must not be empty"));
        }
        Ok(())
    }

    /// Runs the derivation to completion and splits the output into key and
    /// IV. Both encrypt and decrypt go through here, so the cipher is never
    /// constructed from half-derived material.
    fn derive_key_iv(&self) -> (Vec<u8>, Vec<u8>) {
        let mut derived = vec![0u8; self.mode.key_len() + IV_LEN];
        pbkdf2_hmac::<Sha256>(
            self.key.as_bytes(),
            self.salt.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut derived,
        );
        let iv = derived.split_off(self.mode.key_len());
        (derived, iv)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (key, iv) = self.derive_key_iv();
        let ciphertext = match self.mode {
            CipherMode::AesCbc => Aes128CbcEnc::new_from_slices(&key, &iv)
                .map_err(|e| ParloError::Codec(format!("cipher init failed: {}", e)))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            CipherMode::TwofishCbc => TwofishCbcEnc::new_from_slices(&key, &iv)
                .map_err(|e| ParloError::Codec(format!("cipher init failed: {}", e)))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        };
        Ok(ciphertext)
    }

    /// Decrypts ciphertext produced by a peer with the same args. A padding
    /// failure almost always means mismatched key, salt or mode.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.validate()?;
        if ciphertext.is_empty() {
            return Err(ParloError::InvalidArgument("ciphertext must not be empty"));
        }

        let (key, iv) = self.derive_key_iv();
        match self.mode {
            CipherMode::AesCbc => Aes128CbcDec::new_from_slices(&key, &iv)
                .map_err(|e| ParloError::Codec(format!("cipher init failed: {}", e)))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| ParloError::Codec("decryption failed: bad padding".to_string())),
            CipherMode::TwofishCbc => TwofishCbcDec::new_from_slices(&key, &iv)
                .map_err(|e| ParloError::Codec(format!("cipher init failed: {}", e)))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| ParloError::Codec("decryption failed: bad padding".to_string())),
        }
    }
}

/// A packet whose payload goes on the wire as ciphertext. The frame layout
/// matches a regular packet - id, marker byte in the compressed-flag
/// position, little-endian u16 total length, then the ciphertext - so the
/// receiving side reassembles it with the ordinary processing buffer and
/// only then decides to decrypt.
pub struct EncryptedPacket {
    id: u8,
    payload: Vec<u8>,
    args: EncryptionArgs,
}

impl EncryptedPacket {
    /// Marker written in the flag byte of an encrypted frame.
    pub const ENCRYPTED_MARKER: u8 = 1;

    pub fn new(args: EncryptionArgs, id: u8, payload: Vec<u8>) -> Result<EncryptedPacket> {
        args.validate()?;
        if payload.is_empty() {
            return Err(ParloError::InvalidArgument("packet payload must not be empty"));
        }

        Ok(EncryptedPacket { id, payload, args })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encrypts the payload and serializes the frame for transmission.
    ///
    /// CBC padding rounds the ciphertext up to a block boundary, so the
    /// length field is only known after encryption; a payload close to the
    /// 16-bit limit can overflow here rather than at construction.
    pub fn build(&self) -> Result<Vec<u8>> {
        let ciphertext = self.args.encrypt(&self.payload)?;

        let frame_len = HEADER_LEN_STANDARD + ciphertext.len();
        if frame_len > u16::MAX as usize {
            return Err(ParloError::Overflow { size: frame_len, max: u16::MAX as usize });
        }

        let mut buf = Vec::with_capacity(frame_len);
        buf.put_u8(self.id);
        buf.put_u8(Self::ENCRYPTED_MARKER);
        buf.put_u16_le(frame_len as u16);
        buf.put_slice(&ciphertext);
        Ok(buf)
    }
}
