use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use log::{info, warn};
use crate::{Result, Error};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric key used to seal the persisted store.
///
/// The key lives in a side file next to the data, never inside it. The file
/// holds the hex-encoded 32-byte key and nothing else.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let generated = Aes256Gcm::generate_key(OsRng);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(generated.as_slice());
        Self { key }
    }

    /// Builds a cipher from raw key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(Error::InvalidKey("Key must be 32 bytes".to_string()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Parses the hex text stored in a key file.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Hex text as written to the key file.
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Loads a key from a `.txt` side file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = validate_key_path(path.as_ref())?;
        let text = fs::read_to_string(path)?;
        Self::from_hex(&text)
    }

    /// Writes the key verbatim to `path`.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = validate_key_path(path.as_ref())?;
        fs::write(path, self.to_hex())?;
        Ok(())
    }

    /// Loads the key at `requested`, or generates and stores a new one.
    ///
    /// A new key is written to `requested` only when that file does not exist
    /// yet. An existing but unusable key file is left untouched and the new key
    /// goes to an auto-named file in `dir` instead. Returns the key file path
    /// in use together with the cipher.
    pub fn load_or_create(requested: Option<&Path>, dir: &Path) -> Result<(PathBuf, Self)> {
        if let Some(path) = requested {
            validate_key_path(path)?;
            if path.exists() {
                match Self::load(path) {
                    Ok(cipher) => return Ok((path.to_path_buf(), cipher)),
                    Err(e) => warn!("Key file {:?} is unusable, generating a new key: {}", path, e),
                }
            } else {
                let cipher = Self::generate();
                cipher.store(path)?;
                info!("Generated encryption key in {:?}", path);
                return Ok((path.to_path_buf(), cipher));
            }
        }

        let path = dir.join(auto_key_name());
        let cipher = Self::generate();
        cipher.store(&path)?;
        info!("Generated encryption key in {:?}", path);
        Ok((path, cipher))
    }

    /// Encrypts a plaintext string using AES-256-GCM.
    ///
    /// Returns a hex-encoded string containing the nonce followed by the ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, plaintext.as_bytes()).map_err(|e| Error::Internal(e.to_string()))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(hex::encode(combined))
    }

    /// Decrypts the output of [`Cipher::encrypt`].
    pub fn decrypt(&self, cipher_hex: &str) -> Result<String> {
        let combined = hex::decode(cipher_hex).map_err(|_| Error::Decryption)?;
        if combined.len() < NONCE_LEN {
            return Err(Error::Decryption);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext_bytes = cipher.decrypt(nonce, ciphertext).map_err(|_| Error::Decryption)?;
        String::from_utf8(plaintext_bytes).map_err(|_| Error::Decryption)
    }
}

fn validate_key_path(path: &Path) -> Result<&Path> {
    match path.extension().and_then(|s| s.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("txt") => Ok(path),
        _ => Err(Error::UnsupportedFile(path.to_path_buf(), "txt")),
    }
}

fn auto_key_name() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("arkivist-auth-{}.txt", timestamp)
}
