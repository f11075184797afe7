//! # クレデンシャル封印
//!
//! 単発のシークレット受け渡しに使う非対称封印方式。双方向チャネルの
//! セッション鍵とは完全に独立しており、チャネルが確立する前でも使える。
//!
//! ## 方式
//! 1. 送信側がエフェメラルX25519鍵ペアを生成
//! 2. 受信側の静的公開鍵とECDHで共有秘密を導出
//! 3. HKDF-SHA256（固定salt/infoコンテキスト）で256ビット鍵を導出
//! 4. ChaCha20-Poly1305で暗号化。associated dataにエフェメラル公開鍵
//!    バイト列を用いることで、暗号文をその鍵に束縛する（差し替え防止）
//!
//! タグ検証に失敗したクレデンシャルは破棄して再発行する。部分的に
//! 信用してはならない。

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::aead::NONCE_LEN;
use crate::{
    b64_decode, b64_encode, derive_key_with_info, ecdh_derive_shared_secret, CryptoError,
    SymmetricKey,
};

/// 封印鍵導出のHKDF salt。
pub const CREDENTIAL_HKDF_SALT: &[u8] = b"accord-credential-transfer-v1";

/// 封印鍵導出のHKDF infoコンテキスト。
pub const CREDENTIAL_HKDF_INFO: &[u8] = b"credential-encryption";

/// 封印済みクレデンシャル。JSONで受け渡しされる。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedCredential {
    /// Base64エンコードされた暗号文（ct‖tag）
    pub ciphertext: String,
    /// Base64エンコードされた送信側エフェメラルX25519公開鍵
    pub ephemeral_public_key: String,
    /// Base64エンコードされた12バイトnonce
    pub nonce: String,
}

/// エフェメラル鍵と受信側公開鍵から封印鍵を導出する。
fn derive_sealing_key(
    secret: &X25519StaticSecret,
    peer_public: &X25519PublicKey,
) -> Result<SymmetricKey, CryptoError> {
    let shared = ecdh_derive_shared_secret(secret, peer_public);
    derive_key_with_info(CREDENTIAL_HKDF_SALT, &shared, CREDENTIAL_HKDF_INFO)
}

/// クレデンシャルを受信側の公開鍵に対して封印する。
pub fn seal_credentials(
    credentials: &serde_json::Value,
    recipient_public_key: &X25519PublicKey,
) -> Result<SealedCredential, CryptoError> {
    let ephemeral_secret = X25519StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let key = derive_sealing_key(&ephemeral_secret, recipient_public_key)?;
    let plaintext = serde_json::to_vec(credentials)
        .map_err(|e| CryptoError::SerializeError(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &plaintext,
                aad: ephemeral_public.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptError)?;

    Ok(SealedCredential {
        ciphertext: b64_encode(&ciphertext),
        ephemeral_public_key: b64_encode(ephemeral_public.as_bytes()),
        nonce: b64_encode(&nonce_bytes),
    })
}

/// 封印済みクレデンシャルを受信側の静的秘密鍵で開封する。
pub fn open_credentials(
    sealed: &SealedCredential,
    recipient_secret_key: &X25519StaticSecret,
) -> Result<serde_json::Value, CryptoError> {
    let ephemeral_bytes = b64_decode(&sealed.ephemeral_public_key)?;
    let ephemeral_public = crate::x25519_public_from_bytes(&ephemeral_bytes)?;

    let nonce_bytes = b64_decode(&sealed.nonce)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::InvalidEnvelope(format!(
            "nonce長が不正: {} バイト（期待: {NONCE_LEN}）",
            nonce_bytes.len()
        )));
    }
    let data = b64_decode(&sealed.ciphertext)?;

    let key = derive_sealing_key(recipient_secret_key, &ephemeral_public)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &data,
                aad: &ephemeral_bytes,
            },
        )
        .map_err(|_| CryptoError::DecryptError)?;

    serde_json::from_slice(&plaintext).map_err(|e| CryptoError::SerializeError(e.to_string()))
}

/// 受信側の静的X25519鍵を保持するキーリング。
///
/// 公開鍵を配布し、届いた封印済みクレデンシャルを開封する。
/// 秘密鍵はプロセスメモリの外に出ない。
pub struct CredentialKeyring {
    secret_key: X25519StaticSecret,
    public_key: X25519PublicKey,
}

impl CredentialKeyring {
    /// 新しい静的鍵ペアを生成する。
    pub fn generate() -> Self {
        let secret_key = X25519StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// 配布用のBase64エンコード公開鍵。
    pub fn public_key_b64(&self) -> String {
        b64_encode(self.public_key.as_bytes())
    }

    /// 公開鍵の生バイト列。
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public_key.as_bytes()
    }

    /// 封印済みクレデンシャルを開封する。
    pub fn open(&self, sealed: &SealedCredential) -> Result<serde_json::Value, CryptoError> {
        open_credentials(sealed, &self.secret_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seal_open_roundtrip() {
        let keyring = CredentialKeyring::generate();
        let credentials = json!({
            "host": "db.internal",
            "port": "5432",
            "username": "challenge_rw",
            "password": "s3cr3t",
        });

        let recipient_pub = X25519PublicKey::from(keyring.public_key_bytes());
        let sealed = seal_credentials(&credentials, &recipient_pub).unwrap();
        let opened = keyring.open(&sealed).unwrap();
        assert_eq!(opened, credentials);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let keyring = CredentialKeyring::generate();
        let stranger = CredentialKeyring::generate();

        let recipient_pub = X25519PublicKey::from(keyring.public_key_bytes());
        let sealed = seal_credentials(&json!({"password": "x"}), &recipient_pub).unwrap();

        // 無関係な秘密鍵では復号できない（誤ったデータが返ることはない）
        assert!(matches!(
            stranger.open(&sealed),
            Err(CryptoError::DecryptError)
        ));
    }

    #[test]
    fn test_ephemeral_key_substitution_fails() {
        let keyring = CredentialKeyring::generate();
        let recipient_pub = X25519PublicKey::from(keyring.public_key_bytes());
        let sealed = seal_credentials(&json!({"password": "x"}), &recipient_pub).unwrap();

        // エフェメラル公開鍵を差し替えるとAADの束縛により検証が落ちる
        let other = X25519StaticSecret::random_from_rng(OsRng);
        let substituted = SealedCredential {
            ephemeral_public_key: b64_encode(X25519PublicKey::from(&other).as_bytes()),
            ..sealed
        };
        assert!(keyring.open(&substituted).is_err());
    }
}
