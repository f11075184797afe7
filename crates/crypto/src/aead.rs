//! # AEADセッション
//!
//! 導出済みの対称鍵1本を所有し、任意のJSON値を暗号化エンベロープに
//! 包んで送受信するための抽象。鍵以外の状態を持たない。
//!
//! nonceは暗号化のたびに12バイトのランダム値を新規生成する
//! （カウンタ方式ではない）。同一鍵でのnonce再利用は起こらない。

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use accord_types::{EncryptedEnvelope, ENC_CHACHA20POLY1305};

use crate::{b64_decode, b64_encode, CryptoError, SymmetricKey};

/// Poly1305認証タグの長さ（バイト）。
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305のnonce長（バイト）。
pub const NONCE_LEN: usize = 12;

/// 対称鍵1本を所有するAEADセッション。
///
/// ハンドシェイク成功ごとに1つ生成され、チャネルのクローズとともに
/// 破棄される。`encrypt`と`decrypt`は同一鍵に対して互いの逆操作になる。
pub struct AeadSession {
    key: SymmetricKey,
}

impl AeadSession {
    /// 導出済み鍵からセッションを構築する。
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    /// JSON値を暗号化エンベロープに包む。
    ///
    /// 値はJSONテキストに直列化してから暗号化する。直列化の決定性は
    /// 要求されない（復号時に同一バイト列が復元されることのみが重要）。
    pub fn encrypt(&self, value: &serde_json::Value) -> Result<EncryptedEnvelope, CryptoError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| CryptoError::SerializeError(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        // encryptの出力は ct‖tag（16バイトタグが末尾に連結される）
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| CryptoError::EncryptError)?;

        Ok(EncryptedEnvelope {
            enc: ENC_CHACHA20POLY1305.to_string(),
            nonce: b64_encode(&nonce_bytes),
            ciphertext: b64_encode(&ciphertext),
        })
    }

    /// 暗号化エンベロープを復号してJSON値に戻す。
    ///
    /// 以下のいずれかで失敗する。失敗時に部分平文が漏れることはない。
    /// - `enc` タグが未対応
    /// - nonce長が12バイトでない
    /// - 本文がタグ長（16バイト）未満
    /// - 認証タグの検証失敗
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<serde_json::Value, CryptoError> {
        if envelope.enc != ENC_CHACHA20POLY1305 {
            return Err(CryptoError::InvalidEnvelope(format!(
                "未対応のencタグ: {}",
                envelope.enc
            )));
        }

        let nonce_bytes = b64_decode(&envelope.nonce)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::InvalidEnvelope(format!(
                "nonce長が不正: {} バイト（期待: {NONCE_LEN}）",
                nonce_bytes.len()
            )));
        }

        let data = b64_decode(&envelope.ciphertext)?;
        if data.len() < TAG_LEN {
            return Err(CryptoError::InvalidEnvelope(format!(
                "本文が短すぎます: {} バイト（最低: {TAG_LEN}）",
                data.len()
            )));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), data.as_slice())
            .map_err(|_| CryptoError::DecryptError)?;

        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::SerializeError(e.to_string()))
    }
}
