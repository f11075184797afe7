//! # Accord Protocol 署名付きHTTPクライアント
//!
//! 双方向チャネルを持たないピアに対する単方向の通信路。
//!
//! 1. [`bootstrap`] — nonce取得とAttestation提出によるセッション確立
//! 2. [`signer`] — 確立済みセッションでの署名付き（必要なら暗号化）POST
//!
//! すべてのリクエストはエフェメラルEd25519鍵で署名され、ピア側で
//! リプレイ検査の材料になるタイムスタンプとnonceを運ぶ。

use std::time::Duration;

use accord_crypto::CryptoError;

pub mod bootstrap;
pub mod session;
pub mod signer;

pub use bootstrap::bootstrap_attested_session;
pub use session::SigningSession;
pub use signer::{OutboundSigner, SignedResponse};

/// nonce取得（`POST {base}/attestation/challenge`）のタイムアウト。
pub const NONCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Attestation提出（`POST {base}/attest`）のタイムアウト。
pub const ATTEST_TIMEOUT: Duration = Duration::from_secs(20);

/// 確立後の署名付きリクエストのタイムアウト。
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTPクライアント層のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTPトランスポートの失敗
    #[error("HTTPリクエストに失敗: {0}")]
    Http(#[from] reqwest::Error),
    /// ピアが非成功ステータスを返した
    #[error("{endpoint} がステータス {status} を返しました: {body}")]
    PeerRejected {
        endpoint: String,
        status: u16,
        body: String,
    },
    /// レスポンス本文が空
    #[error("{0} のレスポンス本文が空です")]
    EmptyResponse(String),
    /// レスポンス本文のパース失敗
    #[error("レスポンスのパースに失敗: {0}")]
    MalformedResponse(String),
    /// 暗号処理の失敗
    #[error("暗号処理エラー: {0}")]
    Crypto(#[from] CryptoError),
}
