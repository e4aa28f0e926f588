//! Midea payload cryptography.
//! Static LAN key (AES-128-ECB), cloud request signing, the access token
//! derived relay key and the v3 TCP key exchange (AES-256-CBC).

use crate::error::{MideaError, Result};
use aes::{Aes128, Aes256};
use cipher::block_padding::Pkcs7;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit};
use crc::{CRC_8_MAXIM_DOW, Crc};
use ecb::{Decryptor, Encryptor};
use md5::Md5;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Application key shipped with the vendor's mobile app.
pub const DEFAULT_APPKEY: &str = "3742e9e5842d4ad59c2db887e12449f9";
/// Key mixed into LAN packet fingerprints and the static LAN cipher key.
pub const DEFAULT_SIGNKEY: &str = "xhdiwjnchekd4d512chdjx5d8e4c394D2D7S";

const BLOCK: usize = 16;
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);

/// CRC8 (Maxim/Dallas) used over the payload region of appliance frames.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Two's-complement of the byte sum, mod 256.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

fn md5_digest(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// AES-128-ECB with PKCS7 padding.
pub fn ecb_encrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    Encryptor::<Aes128>::new(GenericArray::from_slice(key)).encrypt_padded_vec_mut::<Pkcs7>(data)
}

/// AES-128-ECB decryption, PKCS7 padding is verified and stripped.
pub fn ecb_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || !data.len().is_multiple_of(BLOCK) {
        return Err(MideaError::DecryptionFailed);
    }
    Decryptor::<Aes128>::new(GenericArray::from_slice(key))
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| MideaError::DecryptionFailed)
}

/// AES-256-CBC with a zero IV and no padding, as used on the v3 LAN channel.
pub fn cbc_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if !data.len().is_multiple_of(BLOCK) {
        return Err(MideaError::EncryptionFailed);
    }
    let cipher = Aes256::new_from_slice(key).map_err(|_| MideaError::EncryptionFailed)?;
    let mut out = data.to_vec();
    let mut prev = [0u8; BLOCK];
    for chunk in out.chunks_mut(BLOCK) {
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
    Ok(out)
}

pub fn cbc_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if !data.len().is_multiple_of(BLOCK) {
        return Err(MideaError::DecryptionFailed);
    }
    let cipher = Aes256::new_from_slice(key).map_err(|_| MideaError::DecryptionFailed)?;
    let mut out = data.to_vec();
    let mut prev = [0u8; BLOCK];
    for chunk in out.chunks_mut(BLOCK) {
        let mut current = [0u8; BLOCK];
        current.copy_from_slice(chunk);
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = current;
    }
    Ok(out)
}

/// Token lookup key for an appliance id: SHA-256 of the 6-byte id,
/// first half XOR second half.
pub fn udp_id(appliance_id: u64, big_endian: bool) -> String {
    let id_bytes: Vec<u8> = if big_endian {
        appliance_id.to_be_bytes()[2..].to_vec()
    } else {
        appliance_id.to_le_bytes()[..6].to_vec()
    };
    let digest = Sha256::digest(&id_bytes);
    let folded: Vec<u8> = digest[..16]
        .iter()
        .zip(digest[16..].iter())
        .map(|(a, b)| a ^ b)
        .collect();
    hex::encode(folded)
}

/// Derives the v3 session key from the 64-byte handshake reply.
///
/// The reply carries an AES-256-CBC encrypted random block followed by its
/// SHA-256; the session key is that block XOR the appliance key.
pub fn tcp_key(response: &[u8], key: &[u8]) -> Result<[u8; 32]> {
    if response == b"ERROR" {
        return Err(MideaError::Authentication("handshake rejected".into()));
    }
    if response.len() != 64 {
        return Err(MideaError::Authentication(format!(
            "unexpected handshake length {}",
            response.len()
        )));
    }
    if key.len() != 32 {
        return Err(MideaError::Authentication("appliance key must be 32 bytes".into()));
    }
    let (payload, sign) = response.split_at(32);
    let plain = cbc_decrypt(key, payload)
        .map_err(|_| MideaError::Authentication("handshake decrypt failed".into()))?;
    if Sha256::digest(&plain).as_slice() != sign {
        return Err(MideaError::Authentication("handshake signature mismatch".into()));
    }
    let mut out = [0u8; 32];
    for (o, (p, k)) in out.iter_mut().zip(plain.iter().zip(key.iter())) {
        *o = p ^ k;
    }
    Ok(out)
}

/// Key material for one application key.
///
/// The relay data key is rotated by [`Security::set_access_token`] and read
/// under a lock, so every transparent send sees the latest key.
pub struct Security {
    appkey: String,
    signkey: String,
    lan_key: [u8; 16],
    body_key: [u8; 16],
    data_key: RwLock<Option<String>>,
}

impl std::fmt::Debug for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Security")
            .field("appkey", &self.appkey)
            .field("has_data_key", &self.data_key.read().is_some())
            .finish()
    }
}

impl Default for Security {
    fn default() -> Self {
        Self::new(DEFAULT_APPKEY)
    }
}

impl Security {
    pub fn new(appkey: &str) -> Self {
        Self::with_signkey(appkey, DEFAULT_SIGNKEY)
    }

    pub fn with_signkey(appkey: &str, signkey: &str) -> Self {
        Self {
            appkey: appkey.to_string(),
            signkey: signkey.to_string(),
            lan_key: md5_digest(signkey.as_bytes()),
            body_key: md5_digest(appkey.as_bytes()),
            data_key: RwLock::new(None),
        }
    }

    pub fn appkey(&self) -> &str {
        &self.appkey
    }

    /// Encrypts with the static LAN key.
    pub fn aes_encrypt(&self, data: &[u8]) -> Vec<u8> {
        ecb_encrypt(&self.lan_key, data)
    }

    pub fn aes_decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        ecb_decrypt(&self.lan_key, data)
    }

    /// MD5 of `data` followed by the sign key.
    pub fn md5_fingerprint(&self, data: &[u8]) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(data);
        hasher.update(self.signkey.as_bytes());
        hasher.finalize().into()
    }

    /// Cloud request signature over the URL path and the sorted form fields.
    pub fn sign(&self, url_path: &str, params: &BTreeMap<String, String>) -> String {
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        sha256_hex(format!("{}{}{}", url_path, query, self.appkey).as_bytes())
    }

    pub fn encrypt_password(&self, login_id: &str, password: &str) -> String {
        let hashed = sha256_hex(password.as_bytes());
        sha256_hex(format!("{}{}{}", login_id, hashed, self.appkey).as_bytes())
    }

    /// Rotates the relay data key from a login access token.
    pub fn set_access_token(&self, access_token: &str) -> Result<()> {
        let token = hex::decode(access_token)?;
        let app_md5 = hex::encode(md5_digest(self.appkey.as_bytes()));
        let mut key = [0u8; 16];
        key.copy_from_slice(&app_md5.as_bytes()[..16]);
        let plain = ecb_decrypt(&key, &token)?;
        let data_key =
            String::from_utf8(plain).map_err(|e| MideaError::DecodeError(e.to_string()))?;
        *self.data_key.write() = Some(data_key);
        Ok(())
    }

    pub fn clear_access_token(&self) {
        *self.data_key.write() = None;
    }

    pub fn data_key(&self) -> Option<String> {
        self.data_key.read().clone()
    }

    fn data_cipher_key(&self) -> Result<[u8; 16]> {
        let guard = self.data_key.read();
        let data_key = guard.as_ref().ok_or(MideaError::MissingAccessToken)?;
        data_key
            .as_bytes()
            .try_into()
            .map_err(|_| MideaError::EncryptionFailed)
    }

    /// Encrypts relay payload text with the data key, hex encoded.
    pub fn aes_encrypt_string(&self, data: &str) -> Result<String> {
        let key = self.data_cipher_key()?;
        Ok(hex::encode(ecb_encrypt(&key, data.as_bytes())))
    }

    pub fn aes_decrypt_string(&self, data: &str) -> Result<String> {
        let key = self.data_cipher_key()?;
        let raw = hex::decode(data)?;
        let plain = ecb_decrypt(&key, &raw)?;
        String::from_utf8(plain).map_err(|e| MideaError::DecodeError(e.to_string()))
    }

    /// Encrypts a JSON body under the MD5 digest of the app key.
    pub fn encrypt_request_body(&self, body: &Value) -> Result<String> {
        let text = serde_json::to_string(body)?;
        Ok(hex::encode(ecb_encrypt(&self.body_key, text.as_bytes())))
    }

    pub fn decrypt_response_body(&self, body: &str) -> Result<Value> {
        let raw = hex::decode(body.trim())?;
        let plain = ecb_decrypt(&self.body_key, &raw)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}
