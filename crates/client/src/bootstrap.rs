//! # セッションブートストラップ
//!
//! 双方向チャネルを張れないピアに対し、HTTP 2リクエストで署名セッションを
//! 確立する。
//!
//! 1. `POST {base}/attestation/challenge` — ピア発行のnonceを取得
//! 2. `POST {base}/attest` — nonceに束縛したAttestation証跡と
//!    エフェメラル公開鍵2本を提出し、セッショントークンを受領
//!
//! ピアが暗号化をサポートしていればレスポンスの `crypto` ブロックから
//! AEAD鍵を導出する。ブートストラップの失敗はすべて致命的で、
//! 部分的に確立したセッションは残らない。

use tracing::{debug, info, warn};

use accord_crypto::quote::QuoteSource;
use accord_crypto::{derive_session_key, ecdh_derive_shared_secret, sha256, AeadSession};
use accord_types::{AttestRequest, AttestResponse, AttestationEvidence, NonceResponse};

use crate::session::SigningSession;
use crate::signer::OutboundSigner;
use crate::{ClientError, ATTEST_TIMEOUT, NONCE_TIMEOUT};

fn b64_decode(s: &str) -> Result<Vec<u8>, ClientError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| ClientError::MalformedResponse(format!("Base64デコード失敗: {e}")))
}

/// 非成功ステータスと空本文を弾き、本文テキストを返す。
async fn require_body(endpoint: &str, response: reqwest::Response) -> Result<String, ClientError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(ClientError::PeerRejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    if body.trim().is_empty() {
        return Err(ClientError::EmptyResponse(endpoint.to_string()));
    }
    Ok(body)
}

fn parse<T: serde::de::DeserializeOwned>(endpoint: &str, body: &str) -> Result<T, ClientError> {
    serde_json::from_str(body)
        .map_err(|e| ClientError::MalformedResponse(format!("{endpoint}: {e}")))
}

/// Attestationセッションを確立し、署名付きリクエストを送れる
/// [`OutboundSigner`] を返す。
pub async fn bootstrap_attested_session(
    base_url: &str,
    quote_source: Option<&dyn QuoteSource>,
) -> Result<OutboundSigner, ClientError> {
    let base = base_url.trim_end_matches('/');
    let http = reqwest::Client::new();

    // 1. nonce取得
    let nonce_endpoint = format!("{base}/attestation/challenge");
    debug!(endpoint = %nonce_endpoint, "Attestation nonceを要求します");
    let response = http
        .post(&nonce_endpoint)
        .timeout(NONCE_TIMEOUT)
        .send()
        .await?;
    let body = require_body(&nonce_endpoint, response).await?;
    let NonceResponse { nonce } = parse(&nonce_endpoint, &body)?;

    // 2. 証跡と公開鍵の提出
    let mut session = SigningSession::generate();

    // report_dataはピア発行nonce文字列のSHA-256
    let evidence = match quote_source {
        Some(source) => source.quote(sha256(nonce.as_bytes())).await,
        None => None,
    };
    if quote_source.is_some() && evidence.is_none() {
        warn!("Quoteを取得できませんでした。証跡なしで提出します");
    }

    let request = AttestRequest {
        ephemeral_public_key: session.public_key_b64(),
        attestation: AttestationEvidence {
            attestation_type: "Tdx".to_string(),
            nonce,
            quote: evidence.as_ref().map(|e| e.quote.clone()),
            event_log: evidence.and_then(|e| e.event_log),
            measurements: Vec::new(),
            capabilities: vec!["cvm".to_string()],
        },
        encryption_public_key: session.encryption_public_key_b64(),
    };

    let attest_endpoint = format!("{base}/attest");
    let response = http
        .post(&attest_endpoint)
        .timeout(ATTEST_TIMEOUT)
        .json(&request)
        .send()
        .await?;
    let body = require_body(&attest_endpoint, response).await?;
    let attest: AttestResponse = parse(&attest_endpoint, &body)?;

    // 3. ピアが暗号化をサポートしていればAEAD鍵を導出
    let aead = match &attest.crypto {
        Some(block) => {
            let peer_key_bytes = b64_decode(&block.peer_encryption_public_key)?;
            let peer_public = accord_crypto::x25519_public_from_bytes(&peer_key_bytes)?;
            let salt = b64_decode(&block.hkdf_salt)?;
            let shared = ecdh_derive_shared_secret(session.encryption_secret(), &peer_public);
            Some(AeadSession::new(derive_session_key(&salt, &shared)?))
        }
        None => {
            debug!("ピアは本文暗号化をサポートしていません");
            None
        }
    };

    let encrypted = aead.is_some();
    session.establish(attest.session_token, aead);
    info!(base_url = base, encrypted, "署名セッションを確立しました");
    Ok(OutboundSigner::new(base.to_string(), session))
}
