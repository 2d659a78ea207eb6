//! Legacy OpenSSL PEM encryption (`Proc-Type: 4,ENCRYPTED`).
//!
//! The key is derived with OpenSSL's `EVP_BytesToKey` (MD5, one round, salt
//! = first 8 bytes of the IV) and the body is encrypted in CBC mode with
//! PKCS#7 padding.  The scheme has no MAC; padding is the only integrity
//! signal the cipher layer itself can offer.

use std::fmt;
use std::str::FromStr;

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use zeroize::Zeroizing;

use crate::error::DecryptError;

const SALT_LEN: usize = 8;

/// Block ciphers usable in a `DEK-Info` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegacyCipher {
    DesCbc,
    DesEde3Cbc,
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
}

impl LegacyCipher {
    pub const ALL: [LegacyCipher; 5] = [
        LegacyCipher::DesCbc,
        LegacyCipher::DesEde3Cbc,
        LegacyCipher::Aes128Cbc,
        LegacyCipher::Aes192Cbc,
        LegacyCipher::Aes256Cbc,
    ];

    /// Name as written in `DEK-Info`.
    pub fn name(self) -> &'static str {
        match self {
            Self::DesCbc => "DES-CBC",
            Self::DesEde3Cbc => "DES-EDE3-CBC",
            Self::Aes128Cbc => "AES-128-CBC",
            Self::Aes192Cbc => "AES-192-CBC",
            Self::Aes256Cbc => "AES-256-CBC",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::DesCbc => 8,
            Self::DesEde3Cbc => 24,
            Self::Aes128Cbc => 16,
            Self::Aes192Cbc => 24,
            Self::Aes256Cbc => 32,
        }
    }

    /// Block size, which is also the IV length.
    pub fn block_len(self) -> usize {
        match self {
            Self::DesCbc | Self::DesEde3Cbc => 8,
            Self::Aes128Cbc | Self::Aes192Cbc | Self::Aes256Cbc => 16,
        }
    }

    /// `EVP_BytesToKey(MD5, salt = iv[..8], count = 1)`.
    ///
    /// `D_i = MD5(D_{i-1} || passphrase || salt)`, concatenated until there
    /// are `key_len` bytes.
    pub fn derive_key(self, passphrase: &[u8], iv: &[u8]) -> Zeroizing<Vec<u8>> {
        let salt = &iv[..SALT_LEN.min(iv.len())];
        let mut key = Zeroizing::new(Vec::with_capacity(self.key_len() + 16));
        let mut prev = Zeroizing::new([0u8; 16]);
        let mut first = true;

        while key.len() < self.key_len() {
            let mut input = Zeroizing::new(Vec::with_capacity(16 + passphrase.len() + salt.len()));
            if !first {
                input.extend_from_slice(&*prev);
            }
            input.extend_from_slice(passphrase);
            input.extend_from_slice(salt);

            *prev = md5::compute(input.as_slice()).0;
            key.extend_from_slice(&*prev);
            first = false;
        }

        key.truncate(self.key_len());
        key
    }

    /// Decrypt and strip PKCS#7 padding.
    ///
    /// `key` and `iv` must have the lengths reported by [`key_len`](Self::key_len)
    /// and [`block_len`](Self::block_len).  A padding failure is reported as
    /// [`DecryptError::IncorrectPassphrase`].
    pub fn decrypt(
        self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
        match self {
            Self::DesCbc => cbc_decrypt::<des::Des>(key, iv, ciphertext),
            Self::DesEde3Cbc => cbc_decrypt::<des::TdesEde3>(key, iv, ciphertext),
            Self::Aes128Cbc => cbc_decrypt::<aes::Aes128>(key, iv, ciphertext),
            Self::Aes192Cbc => cbc_decrypt::<aes::Aes192>(key, iv, ciphertext),
            Self::Aes256Cbc => cbc_decrypt::<aes::Aes256>(key, iv, ciphertext),
        }
    }

    /// Pad with PKCS#7 and encrypt.
    pub fn encrypt(self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        match self {
            Self::DesCbc => cbc_encrypt::<des::Des>(key, iv, plaintext),
            Self::DesEde3Cbc => cbc_encrypt::<des::TdesEde3>(key, iv, plaintext),
            Self::Aes128Cbc => cbc_encrypt::<aes::Aes128>(key, iv, plaintext),
            Self::Aes192Cbc => cbc_encrypt::<aes::Aes192>(key, iv, plaintext),
            Self::Aes256Cbc => cbc_encrypt::<aes::Aes256>(key, iv, plaintext),
        }
    }
}

impl fmt::Display for LegacyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LegacyCipher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| s.to_string())
    }
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, DecryptError>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|e| DecryptError::Corrupt(format!("cipher init: {e}")))?;

    let mut buf = Zeroizing::new(ciphertext.to_vec());
    let len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| DecryptError::IncorrectPassphrase)?
        .len();
    buf.truncate(len);
    Ok(buf)
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, DecryptError>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|e| DecryptError::Corrupt(format!("cipher init: {e}")))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip_through_from_str() {
        for cipher in LegacyCipher::ALL {
            assert_eq!(cipher.name().parse::<LegacyCipher>().unwrap(), cipher);
        }
        assert_eq!("aes-256-cbc".parse::<LegacyCipher>().unwrap(), LegacyCipher::Aes256Cbc);
        assert!("AES-256-GCM".parse::<LegacyCipher>().is_err());
    }

    #[test]
    fn derive_key_matches_openssl() {
        // openssl enc -aes-128-cbc -pass pass:password -S 0102030405060708 -P -md md5
        let iv = hex::decode("0102030405060708090a0b0c0d0e0f10").unwrap();
        let key = LegacyCipher::Aes128Cbc.derive_key(b"password", &iv);
        assert_eq!(hex::encode(&*key), "e7b0971e52ca5cc8d0539fb3412f6316");
    }

    #[test]
    fn derive_key_extends_past_one_digest() {
        let iv = [7u8; 16];
        let k24 = LegacyCipher::DesEde3Cbc.derive_key(b"pw", &iv);
        let k32 = LegacyCipher::Aes256Cbc.derive_key(b"pw", &iv);
        assert_eq!(k24.len(), 24);
        assert_eq!(k32.len(), 32);
        // Both come from the same digest chain, so one is a prefix of the other.
        assert_eq!(&k32[..24], &k24[..]);
    }

    #[test]
    fn encrypt_decrypt_roundtrip_all_ciphers() {
        let plaintext = b"key material, 23 bytes.";
        for cipher in LegacyCipher::ALL {
            let iv = vec![0x42; cipher.block_len()];
            let key = cipher.derive_key(b"correct-horse", &iv);
            let ct = cipher.encrypt(&key, &iv, plaintext).unwrap();
            assert_eq!(ct.len() % cipher.block_len(), 0, "{cipher}");
            let pt = cipher.decrypt(&key, &iv, &ct).unwrap();
            assert_eq!(pt.as_slice(), plaintext, "{cipher}");
        }
    }
}
