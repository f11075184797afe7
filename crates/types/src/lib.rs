//! # Accord Protocol 共有型定義
//!
//! チャレンジとリモートピアの間で交換されるワイヤメッセージを
//! Rust構造体として提供する。
//!
//! ## エンコーディング規則
//! - Base64: バイナリデータ（公開鍵、nonce、暗号文、署名）
//! - Hex: ハンドシェイクnonce（32バイトのランダム値）

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// 実行環境モード
// ---------------------------------------------------------------------------

/// 接続両端の実行環境モード。dev↔prodの相互接続は禁止される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentMode {
    /// 開発環境
    Dev,
    /// 本番環境
    Prod,
}

impl fmt::Display for EnvironmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentMode::Dev => write!(f, "dev"),
            EnvironmentMode::Prod => write!(f, "prod"),
        }
    }
}

impl FromStr for EnvironmentMode {
    type Err = UnknownEnvironmentMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(EnvironmentMode::Dev),
            "prod" => Ok(EnvironmentMode::Prod),
            other => Err(UnknownEnvironmentMode(other.to_string())),
        }
    }
}

/// 未知の環境モード文字列。
#[derive(Debug, thiserror::Error)]
#[error("未知の環境モード: {0}")]
pub struct UnknownEnvironmentMode(pub String);

// ---------------------------------------------------------------------------
// ハンドシェイクメッセージ（双方向チャネル）
// ---------------------------------------------------------------------------

/// 双方向チャネルのハンドシェイクで交換される平文JSONメッセージ。
///
/// ハンドシェイク完了後のフレームはすべて [`EncryptedEnvelope`] で包まれる。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// 接続開始。イニシエータが送信する。
    AttestationBegin {
        /// 32バイトランダムnonceのhex表現
        nonce: String,
        /// 接続先ピアの識別子
        peer_id: String,
        /// Base64エンコードされたイニシエータのX25519公開鍵（32バイト）
        local_public_key: String,
        /// Base64エンコードされたAttestation Quote（取得できた場合のみ）
        #[serde(skip_serializing_if = "Option::is_none")]
        quote: Option<String>,
        /// Attestationイベントログ（JSON文字列、取得できた場合のみ）
        #[serde(skip_serializing_if = "Option::is_none")]
        event_log: Option<String>,
    },
    /// アクセプタの公開鍵応答。
    AttestationResponse {
        /// Base64エンコードされたアクセプタのX25519公開鍵（32バイト）
        peer_public_key: String,
    },
    /// ハンドシェイク完了通知。鍵導出用saltを運ぶ。
    AttestationOk {
        /// Base64エンコードされたHKDF salt
        hkdf_salt: String,
    },
}

// ---------------------------------------------------------------------------
// 暗号化エンベロープ
// ---------------------------------------------------------------------------

/// 暗号化方式の識別タグ。
pub const ENC_CHACHA20POLY1305: &str = "chacha20poly1305";

/// AEADで暗号化されたワイヤフレーム。
///
/// ciphertextは暗号文の末尾に16バイトの認証タグを連結したもの。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// 暗号化方式タグ（現在は `"chacha20poly1305"` のみ）
    pub enc: String,
    /// Base64エンコードされた12バイトランダムnonce
    pub nonce: String,
    /// Base64エンコードされた暗号文（ct‖tag）
    pub ciphertext: String,
}

// ---------------------------------------------------------------------------
// ブートストラップHTTP（単発署名セッション確立）
// ---------------------------------------------------------------------------

/// `POST {base}/attestation/challenge` のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceResponse {
    /// ピアが発行した不透明なnonce文字列
    pub nonce: String,
}

/// ブートストラップ時に提出するAttestation証跡。
///
/// Quoteが取得できない環境では各フィールドがnullのまま提出される
/// （非致命、ピア側のポリシーで判断される）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationEvidence {
    /// Attestation種別（例: `"Tdx"`）
    pub attestation_type: String,
    /// ピアが発行したnonce（report_dataのバインド対象）
    pub nonce: String,
    /// Base64エンコードされたQuote
    pub quote: Option<String>,
    /// イベントログ（JSON文字列）
    pub event_log: Option<String>,
    /// 測定値の一覧
    pub measurements: Vec<String>,
    /// 実行環境の能力宣言（例: `["cvm"]`）
    pub capabilities: Vec<String>,
}

/// `POST {base}/attest` のリクエスト本文。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestRequest {
    /// Base64エンコードされたEd25519署名用公開鍵
    pub ephemeral_public_key: String,
    /// Attestation証跡
    pub attestation: AttestationEvidence,
    /// Base64エンコードされたX25519暗号化用公開鍵
    pub encryption_public_key: String,
}

/// `POST {base}/attest` のレスポンス本文。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestResponse {
    /// 以後の署名付きリクエストに付与するセッショントークン
    pub session_token: String,
    /// 鍵導出パラメータ（ピアが暗号化をサポートする場合のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto: Option<CryptoBlock>,
}

/// AEAD鍵導出に必要なピア側パラメータ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoBlock {
    /// Base64エンコードされたピアのX25519公開鍵
    pub peer_encryption_public_key: String,
    /// Base64エンコードされたHKDF salt
    pub hkdf_salt: String,
}
