//! # Accord Protocol 双方向セキュアチャネル
//!
//! WebSocket上に相互Attestationハンドシェイクを行い、以後の全フレームを
//! AEADエンベロープで暗号化する永続チャネルを提供する。
//!
//! ## 構成
//! - [`handshake`] — attestation_begin / attestation_response / attestation_ok
//!   の3メッセージ交換と鍵導出（イニシエータ側・アクセプタ側）
//! - [`channel`] — 確立済みチャネルの送受信。相関IDによる要求応答の突合と
//!   バックグラウンド受信ループ

use std::time::Duration;

use accord_crypto::CryptoError;
use accord_crypto::quote::QuoteError;

pub mod channel;
pub mod handshake;

pub use channel::{ChannelState, SecureChannel};
pub use handshake::{accept, initiate, HandshakeInfo, QuoteEvidence, QuoteSource};

/// Attestation交換全体のタイムアウト。
pub const ATTESTATION_TIMEOUT: Duration = Duration::from_secs(20);

/// 要求応答のデフォルトタイムアウト。
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 非致命的な受信エラー後のバックオフ。
pub const RECEIVE_BACKOFF: Duration = Duration::from_millis(100);

/// チャネル層のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// WebSocket接続・送受信の失敗
    #[error("トランスポートエラー: {0}")]
    Transport(String),
    /// ハンドシェイクの構造違反（期待外のメッセージ、欠落フィールド）
    #[error("ハンドシェイク失敗: {0}")]
    Handshake(String),
    /// ピアQuoteの検証失敗
    #[error("Quote検証に失敗: {0}")]
    QuoteRejected(#[from] QuoteError),
    /// 暗号処理の失敗
    #[error("暗号処理エラー: {0}")]
    Crypto(#[from] CryptoError),
    /// 応答待ちのタイムアウト
    #[error("応答待ちがタイムアウトしました（{0:?}）")]
    Timeout(Duration),
    /// チャネルが開いていない
    #[error("チャネルが開いていません（状態: {0}）")]
    NotOpen(ChannelState),
    /// プロトコル違反（復号後のメッセージ構造が不正）
    #[error("プロトコル違反: {0}")]
    Protocol(String),
}

/// 要求応答突合用の相関ID（16バイトのランダム値のhex表現）を生成する。
pub(crate) fn new_correlation_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
