//! # 署名付きHTTP送信
//!
//! 確立済みセッションでのPOSTリクエスト。すべてのリクエストに
//! 正規化文字列へのEd25519署名が付き、AEAD鍵があれば本文を暗号化する。
//!
//! ## 正規化文字列
//! ```text
//! METHOD \n path \n sha256hex(body) \n timestamp \n nonce \n session_token
//! ```
//! 本文ハッシュはワイヤ上のバイト列（暗号化後）に対して計算する。

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use accord_crypto::sha256_hex;

use crate::session::SigningSession;
use crate::{ClientError, REQUEST_TIMEOUT};

/// 暗号化された本文のContent-Type。
pub const ENCRYPTED_CONTENT_TYPE: &str = "application/x-encrypted+json";

/// 署名検証に使うヘッダ名。
pub const HEADER_SESSION_TOKEN: &str = "x-session-token";
pub const HEADER_PUBLIC_KEY: &str = "x-public-key";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_SIGNATURE: &str = "x-signature";

/// 署名付きリクエストの応答。
#[derive(Debug)]
pub struct SignedResponse {
    pub status: u16,
    pub body: String,
}

impl SignedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ClientError::MalformedResponse(e.to_string()))
    }
}

/// 確立済みセッションを持つ署名付きHTTPクライアント。
pub struct OutboundSigner {
    base_url: String,
    http: reqwest::Client,
    session: SigningSession,
}

impl OutboundSigner {
    pub fn new(base_url: String, session: SigningSession) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
            session,
        }
    }

    /// セッション状態への参照。
    pub fn session(&self) -> &SigningSession {
        &self.session
    }

    /// 署名対象の正規化文字列を組み立てる。
    fn canonical_string(
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: u64,
        nonce: &str,
        token: &str,
    ) -> String {
        format!(
            "{method}\n{path}\n{}\n{timestamp}\n{nonce}\n{token}",
            sha256_hex(body)
        )
    }

    /// 署名付きPOSTリクエストを送る。
    ///
    /// AEAD鍵が取り付けられている場合、本文は暗号化エンベロープに包まれ
    /// Content-Typeが [`ENCRYPTED_CONTENT_TYPE`] になる。
    pub async fn post(&self, path: &str, body: Option<&Value>) -> Result<SignedResponse, ClientError> {
        let (body_string, content_type) = match self.session.aead() {
            Some(aead) => {
                let value = body.cloned().unwrap_or(Value::Null);
                let envelope = aead.encrypt(&value)?;
                let text = serde_json::to_string(&envelope)
                    .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;
                (text, ENCRYPTED_CONTENT_TYPE)
            }
            None => {
                let text = match body {
                    Some(value) => serde_json::to_string(value)
                        .map_err(|e| ClientError::MalformedResponse(e.to_string()))?,
                    None => String::new(),
                };
                (text, "application/json")
            }
        };

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let nonce = Uuid::new_v4().to_string();
        let canonical = Self::canonical_string(
            "POST",
            path,
            body_string.as_bytes(),
            timestamp,
            &nonce,
            self.session.token(),
        );
        let signature = self.session.sign_b64(canonical.as_bytes());

        debug!(path, content_type, "署名付きリクエストを送信します");
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .header("content-type", content_type)
            .header(HEADER_SESSION_TOKEN, self.session.token())
            .header(HEADER_PUBLIC_KEY, self.session.public_key_b64())
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_NONCE, nonce)
            .header(HEADER_SIGNATURE, signature)
            .body(body_string)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(SignedResponse { status, body })
    }

    /// 死活監視の通知。非成功ステータスはエラーとして返す。
    pub async fn heartbeat(&self, challenge_id: &str) -> Result<(), ClientError> {
        let response = self
            .post(
                "/cvm/heartbeat",
                Some(&serde_json::json!({"challenge_id": challenge_id})),
            )
            .await?;
        if !response.is_success() {
            return Err(ClientError::PeerRejected {
                endpoint: "/cvm/heartbeat".to_string(),
                status: response.status,
                body: response.body,
            });
        }
        Ok(())
    }
}
