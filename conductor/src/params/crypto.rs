//! Reversible encryption for secret config values.
//!
//! Stored form: `MARKER` + base64(nonce || ciphertext || tag). The marker lets
//! already encrypted values pass through a save untouched.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::schema::{ConfigDefinition, FieldType};

pub const MARKER: &str = "$CRYPT;1;";
const NONCE_LEN: usize = 12;

pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Key is the SHA-256 of the configured secret
    pub fn new(secret_key: &str) -> Self {
        let key = Sha256::digest(secret_key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(MARKER)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", MARKER, BASE64.encode(combined)))
    }

    /// Plain values are returned as is
    pub fn decrypt(&self, value: &str) -> Result<String> {
        let Some(encoded) = value.strip_prefix(MARKER) else {
            return Ok(value.to_string());
        };
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| anyhow!("Invalid secret encoding: {}", e))?;
        if combined.len() < NONCE_LEN {
            return Err(anyhow!("Secret value too short"));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("Decryption failed: {}", e))?;
        String::from_utf8(plaintext).map_err(|e| anyhow!("Invalid UTF-8 in secret: {}", e))
    }

    /// Encrypt every secret leaf of `config` in place
    pub fn seal(&self, schema: &ConfigDefinition, config: &mut Value) -> Result<()> {
        self.transform(schema, config, |v| self.encrypt(v))
    }

    /// Decrypt every secret leaf of `config` in place
    pub fn unseal(&self, schema: &ConfigDefinition, config: &mut Value) -> Result<()> {
        self.transform(schema, config, |v| self.decrypt(v))
    }

    /// Decrypt every marked string anywhere in `value`, schema or not
    pub fn reveal(&self, value: &mut Value) -> Result<()> {
        match value {
            Value::String(s) if Self::is_encrypted(s) => {
                *s = self.decrypt(s)?;
            }
            Value::Array(items) => {
                for item in items {
                    self.reveal(item)?;
                }
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    self.reveal(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn transform<F>(&self, schema: &ConfigDefinition, config: &mut Value, op: F) -> Result<()>
    where
        F: Fn(&str) -> Result<String>,
    {
        for leaf in schema.leaves() {
            if !leaf.field.field_type.is_secret() {
                continue;
            }
            let Some(current) = leaf.get(config).cloned() else {
                continue;
            };
            let next = match (&leaf.field.field_type, current) {
                (FieldType::Secretmap, Value::Object(map)) => {
                    let mut sealed = serde_json::Map::new();
                    for (key, value) in map {
                        let value = match value {
                            Value::String(s) => Value::String(op(&s)?),
                            other => other,
                        };
                        sealed.insert(key, value);
                    }
                    Value::Object(sealed)
                }
                (_, Value::String(s)) => Value::String(op(&s)?),
                (_, other) => other,
            };
            leaf.set(config, next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = SecretCipher::new("test-key");
        let sealed = cipher.encrypt("s3cret").unwrap();
        assert!(SecretCipher::is_encrypted(&sealed));
        assert_ne!(sealed, cipher.encrypt("s3cret").unwrap());
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "s3cret");
    }

    #[test]
    fn test_encrypted_value_is_not_sealed_twice() {
        let cipher = SecretCipher::new("test-key");
        let sealed = cipher.encrypt("s3cret").unwrap();
        assert_eq!(cipher.encrypt(&sealed).unwrap(), sealed);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = SecretCipher::new("a").encrypt("x").unwrap();
        assert!(SecretCipher::new("b").decrypt(&sealed).is_err());
    }

    #[test]
    fn test_seal_tree() {
        let schema: ConfigDefinition = serde_json::from_value(json!([
            {"name": "user", "type": "string"},
            {"name": "pass", "type": "password"},
            {"name": "keys", "type": "secretmap"}
        ]))
        .unwrap();
        let cipher = SecretCipher::new("k");
        let mut config = json!({"user": "u", "pass": "p", "keys": {"a": "1"}});

        cipher.seal(&schema, &mut config).unwrap();
        assert_eq!(config["user"], "u");
        assert!(SecretCipher::is_encrypted(config["pass"].as_str().unwrap()));
        assert!(SecretCipher::is_encrypted(config["keys"]["a"].as_str().unwrap()));

        cipher.unseal(&schema, &mut config).unwrap();
        assert_eq!(config, json!({"user": "u", "pass": "p", "keys": {"a": "1"}}));
    }

    #[test]
    fn test_reveal_walks_whole_tree() {
        let cipher = SecretCipher::new("k");
        let mut config = json!({
            "plain": "x",
            "nested": {"pass": cipher.encrypt("p").unwrap()},
            "list": [cipher.encrypt("q").unwrap(), 3]
        });
        cipher.reveal(&mut config).unwrap();
        assert_eq!(config, json!({"plain": "x", "nested": {"pass": "p"}, "list": ["q", 3]}));
    }
}
