//! # Accord Protocol 暗号処理
//!
//! ハンドシェイクとセッション暗号化に使用する暗号プリミティブを実装する。
//!
//! ## 暗号アルゴリズム
//! | 用途 | アルゴリズム |
//! |------|------------|
//! | 鍵交換 | X25519 ECDH |
//! | 鍵導出 | HKDF-SHA256 |
//! | 対称暗号 | ChaCha20-Poly1305 |
//! | 署名 | Ed25519 |
//! | ハッシュ | SHA-256 |

use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

pub use ed25519_dalek::{
    Signature as Ed25519Signature, SigningKey as Ed25519SigningKey,
    VerifyingKey as Ed25519VerifyingKey,
};
pub use x25519_dalek::{PublicKey, StaticSecret};

pub mod aead;
pub mod quote;
pub mod sealer;

pub use aead::AeadSession;

/// セッション鍵導出のHKDF infoコンテキスト。
/// ブートストラップと双方向チャネルの両ハンドシェイクで共通。
pub const SESSION_KEY_INFO: &[u8] = b"accord-session-v1";

/// 暗号処理のエラー型
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// HKDF鍵導出エラー
    #[error("HKDF鍵導出に失敗しました: {0}")]
    HkdfError(String),
    /// AEAD暗号化エラー
    #[error("AEAD暗号化に失敗しました")]
    EncryptError,
    /// AEAD復号エラー（タグ検証失敗を含む）
    #[error("AEAD復号に失敗しました")]
    DecryptError,
    /// エンベロープ構造の不正（encタグ、nonce長、本文長）
    #[error("不正な暗号化エンベロープ: {0}")]
    InvalidEnvelope(String),
    /// Base64デコードに失敗
    #[error("Base64デコードに失敗: {0}")]
    Base64Error(String),
    /// シリアライズ/デシリアライズに失敗
    #[error("シリアライズに失敗: {0}")]
    SerializeError(String),
    /// Ed25519署名検証エラー
    #[error("Ed25519署名検証に失敗しました")]
    SignatureVerifyError,
    /// 公開鍵の長さが不正
    #[error("公開鍵の長さが不正です: {0} バイト（期待: 32）")]
    InvalidKeyLength(usize),
}

/// 対称鍵（ChaCha20-Poly1305用、32バイト）
pub type SymmetricKey = [u8; 32];

/// X25519 ECDHによる共有秘密の導出。
///
/// イニシエータ側: `ECDH(local_sk, peer_pk)`
/// アクセプタ側: `ECDH(peer_sk, local_pk)`
pub fn ecdh_derive_shared_secret(
    secret_key: &X25519StaticSecret,
    public_key: &X25519PublicKey,
) -> [u8; 32] {
    let shared = secret_key.diffie_hellman(public_key);
    *shared.as_bytes()
}

/// HKDF-SHA256によるセッション鍵の導出。
///
/// ハンドシェイクで受領したsaltと共有秘密から256ビット鍵を展開する。
pub fn derive_session_key(
    salt: &[u8],
    shared_secret: &[u8; 32],
) -> Result<SymmetricKey, CryptoError> {
    derive_key_with_info(salt, shared_secret, SESSION_KEY_INFO)
}

/// HKDF-SHA256による鍵導出（infoコンテキスト指定版）。
pub fn derive_key_with_info(
    salt: &[u8],
    shared_secret: &[u8; 32],
    info: &[u8],
) -> Result<SymmetricKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|e| CryptoError::HkdfError(e.to_string()))?;
    Ok(key)
}

/// Ed25519による署名。
pub fn ed25519_sign(signing_key: &Ed25519SigningKey, message: &[u8]) -> Ed25519Signature {
    signing_key.sign(message)
}

/// Ed25519による署名検証。
pub fn ed25519_verify(
    verifying_key: &Ed25519VerifyingKey,
    message: &[u8],
    signature: &Ed25519Signature,
) -> Result<(), CryptoError> {
    verifying_key
        .verify(message, signature)
        .map_err(|_| CryptoError::SignatureVerifyError)
}

/// SHA-256ハッシュ計算。
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// SHA-256ハッシュのhex表現。署名対象の正規化文字列に使用する。
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Base64（Standard）デコードのヘルパー。
pub(crate) fn b64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| CryptoError::Base64Error(e.to_string()))
}

/// Base64（Standard）エンコードのヘルパー。
pub(crate) fn b64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// 32バイトの公開鍵バイト列を [`X25519PublicKey`] に変換する。
pub fn x25519_public_from_bytes(bytes: &[u8]) -> Result<X25519PublicKey, CryptoError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
    Ok(X25519PublicKey::from(arr))
}
