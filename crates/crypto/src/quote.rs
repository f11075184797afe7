//! # Attestation Quote 検証
//!
//! ピアから提示されたAttestation Quoteの構造検証を提供する。
//!
//! 検証内容は3点。純粋関数でありI/Oを行わない。
//! 1. 構造的最小長（report_dataフィールドが収まる長さ）
//! 2. 固定オフセットのreport_dataとSHA-256(nonce)の一致（nonce束縛）
//! 3. イベントログに宣言された環境モードとローカルモードの一致
//!    （dev↔prodの相互接続禁止）

use async_trait::async_trait;
use serde::Deserialize;

use accord_types::EnvironmentMode;

use crate::{b64_decode, sha256};

/// Attestation Quoteとイベントログの組。
#[derive(Debug, Clone)]
pub struct QuoteEvidence {
    /// Base64エンコードされたQuote
    pub quote: String,
    /// イベントログ（JSON文字列）
    pub event_log: Option<String>,
}

/// Attestation Quoteの供給元。
///
/// report_data（ピアに渡すnonceのSHA-256）に束縛されたQuoteを返す。
/// 取得できない環境では `None` を返し、ハンドシェイクはQuoteなしで
/// 続行される（受理するかはピア側のポリシー）。
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(&self, report_data: [u8; 32]) -> Option<QuoteEvidence>;
}

/// Quote内のreport_dataフィールドのオフセット（バイト）。
pub const REPORT_DATA_OFFSET: usize = 568;

/// report_dataフィールドの長さ（バイト）。
pub const REPORT_DATA_LEN: usize = 32;

/// Quoteの構造的最小長。report_dataフィールド全体が収まる長さ。
pub const QUOTE_MIN_LEN: usize = REPORT_DATA_OFFSET + REPORT_DATA_LEN;

/// Quote検証のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    /// Base64デコードに失敗
    #[error("QuoteのBase64デコードに失敗: {0}")]
    Base64Error(String),
    /// Quoteが構造的最小長に満たない
    #[error("Quoteが短すぎます: {len} バイト（最低: {min}）")]
    TooShort { len: usize, min: usize },
    /// report_dataがSHA-256(nonce)と一致しない
    #[error("report_dataがnonceに束縛されていません")]
    NonceBindingMismatch,
    /// 環境モードの不一致（dev↔prod）
    #[error("環境モードが一致しません: ローカル={local}, ピア={peer}")]
    EnvironmentMismatch {
        local: EnvironmentMode,
        peer: EnvironmentMode,
    },
}

/// イベントログのうち検証に関与するフィールド。
#[derive(Debug, Deserialize)]
struct EventLog {
    environment_mode: Option<EnvironmentMode>,
}

/// ピアのQuoteを検証する。
///
/// - `quote_b64` — Base64エンコードされたQuote
/// - `event_log_json` — ピアが提示したイベントログ（JSON文字列、任意）
/// - `nonce` — ローカルで生成しピアに渡したnonceの生バイト列
/// - `local_mode` — ローカルの実行環境モード
///
/// イベントログが無い、またはパースできずに環境モードが読めない場合、
/// 環境チェックはスキップされる（nonce束縛の検証は常に行う）。
pub fn verify_peer_quote(
    quote_b64: &str,
    event_log_json: Option<&str>,
    nonce: &[u8],
    local_mode: EnvironmentMode,
) -> Result<(), QuoteError> {
    let quote = b64_decode(quote_b64).map_err(|e| QuoteError::Base64Error(e.to_string()))?;

    if quote.len() < QUOTE_MIN_LEN {
        return Err(QuoteError::TooShort {
            len: quote.len(),
            min: QUOTE_MIN_LEN,
        });
    }

    let report_data = &quote[REPORT_DATA_OFFSET..REPORT_DATA_OFFSET + REPORT_DATA_LEN];
    let expected = sha256(nonce);
    if report_data != expected {
        return Err(QuoteError::NonceBindingMismatch);
    }

    if let Some(raw) = event_log_json {
        let peer_mode = serde_json::from_str::<EventLog>(raw)
            .ok()
            .and_then(|log| log.environment_mode);
        if let Some(peer) = peer_mode {
            if peer != local_mode {
                return Err(QuoteError::EnvironmentMismatch {
                    local: local_mode,
                    peer,
                });
            }
        }
    }

    Ok(())
}
