//! # 相互Attestationハンドシェイク
//!
//! WebSocket確立直後に平文JSONで行う3メッセージ交換。
//!
//! ```text
//! イニシエータ                         アクセプタ
//!   attestation_begin    ──────────▶   nonce束縛・環境モード検証
//!                        ◀──────────   attestation_response
//!                        ◀──────────   attestation_ok (hkdf_salt)
//! ```
//!
//! 双方がX25519 ECDHの共有秘密とアクセプタ発行のsaltから
//! HKDF-SHA256でセッション鍵を導出する。ハンドシェイク以後の
//! フレームはすべて暗号化される。

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use accord_crypto::quote::verify_peer_quote;
use accord_crypto::{derive_session_key, ecdh_derive_shared_secret, sha256, AeadSession};
use accord_types::{EnvironmentMode, HandshakeMessage};

use crate::ChannelError;

pub use accord_crypto::quote::{QuoteEvidence, QuoteSource};

/// アクセプタ側のハンドシェイク結果。
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// イニシエータが名乗ったピア識別子
    pub peer_id: String,
    /// Quoteが提示され検証を通過したか
    pub quote_verified: bool,
}

/// 次の平文ハンドシェイクメッセージを受信する。
///
/// Ping/Pongフレームは読み飛ばす。ストリーム終端・Closeフレーム・
/// テキスト以外のデータフレームはハンドシェイク失敗として扱う。
async fn recv_handshake<S>(ws: &mut S) -> Result<HandshakeMessage, ChannelError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = ws
            .next()
            .await
            .ok_or_else(|| ChannelError::Handshake("ピアが接続を切断しました".to_string()))?
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| ChannelError::Handshake(format!("不正なメッセージ: {e}")));
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                return Err(ChannelError::Handshake(
                    "ハンドシェイク中にCloseフレームを受信しました".to_string(),
                ));
            }
            other => {
                return Err(ChannelError::Handshake(format!(
                    "期待外のフレーム種別: {other:?}"
                )));
            }
        }
    }
}

async fn send_handshake<S>(ws: &mut S, message: &HandshakeMessage) -> Result<(), ChannelError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = serde_json::to_string(message)
        .map_err(|e| ChannelError::Handshake(format!("シリアライズ失敗: {e}")))?;
    ws.send(Message::Text(text))
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))
}

/// Base64エンコードされた32バイト公開鍵をデコードする。
fn decode_peer_key(b64: &str) -> Result<X25519PublicKey, ChannelError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| ChannelError::Handshake(format!("公開鍵のBase64デコード失敗: {e}")))?;
    accord_crypto::x25519_public_from_bytes(&bytes)
        .map_err(|_| ChannelError::Handshake(format!("公開鍵の長さが不正: {} バイト", bytes.len())))
}

fn b64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// イニシエータ側のハンドシェイクを実行する。
///
/// 成功時、導出済みセッション鍵を持つ [`AeadSession`] を返す。
/// 期待外のメッセージ・欠落フィールド・鍵長不正はすべて
/// [`ChannelError::Handshake`] で失敗し、チャネルは確立しない。
pub async fn initiate<S>(
    ws: &mut S,
    peer_id: &str,
    quote_source: Option<&dyn QuoteSource>,
) -> Result<AeadSession, ChannelError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);

    let local_secret = X25519StaticSecret::random_from_rng(OsRng);
    let local_public = X25519PublicKey::from(&local_secret);

    // report_dataはハンドシェイクnonceのSHA-256
    let evidence = match quote_source {
        Some(source) => source.quote(sha256(&nonce)).await,
        None => None,
    };
    if quote_source.is_some() && evidence.is_none() {
        warn!("Quoteを取得できませんでした。Quoteなしでハンドシェイクを続行します");
    }

    send_handshake(
        ws,
        &HandshakeMessage::AttestationBegin {
            nonce: hex::encode(nonce),
            peer_id: peer_id.to_string(),
            local_public_key: b64(local_public.as_bytes()),
            quote: evidence.as_ref().map(|e| e.quote.clone()),
            event_log: evidence.and_then(|e| e.event_log),
        },
    )
    .await?;

    let peer_public = match recv_handshake(ws).await? {
        HandshakeMessage::AttestationResponse { peer_public_key } => {
            decode_peer_key(&peer_public_key)?
        }
        other => {
            return Err(ChannelError::Handshake(format!(
                "attestation_responseを期待しましたが別のメッセージを受信: {other:?}"
            )));
        }
    };

    let hkdf_salt = match recv_handshake(ws).await? {
        HandshakeMessage::AttestationOk { hkdf_salt } => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(&hkdf_salt)
                .map_err(|e| ChannelError::Handshake(format!("saltのBase64デコード失敗: {e}")))?
        }
        other => {
            return Err(ChannelError::Handshake(format!(
                "attestation_okを期待しましたが別のメッセージを受信: {other:?}"
            )));
        }
    };

    let shared = ecdh_derive_shared_secret(&local_secret, &peer_public);
    let key = derive_session_key(&hkdf_salt, &shared)?;
    debug!(peer_id, "ハンドシェイク完了、セッション鍵を導出しました");
    Ok(AeadSession::new(key))
}

/// アクセプタ側のハンドシェイクを実行する。
///
/// イニシエータがQuoteを提示した場合はnonce束縛と環境モードを検証し、
/// 失敗すればハンドシェイクを拒否する。Quoteなしの接続は受理し、
/// [`HandshakeInfo::quote_verified`] で区別できるようにする。
pub async fn accept<S>(
    ws: &mut S,
    local_mode: EnvironmentMode,
) -> Result<(AeadSession, HandshakeInfo), ChannelError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let (nonce_hex, peer_id, peer_key_b64, quote, event_log) = match recv_handshake(ws).await? {
        HandshakeMessage::AttestationBegin {
            nonce,
            peer_id,
            local_public_key,
            quote,
            event_log,
        } => (nonce, peer_id, local_public_key, quote, event_log),
        other => {
            return Err(ChannelError::Handshake(format!(
                "attestation_beginを期待しましたが別のメッセージを受信: {other:?}"
            )));
        }
    };

    let nonce = hex::decode(&nonce_hex)
        .map_err(|e| ChannelError::Handshake(format!("nonceのhexデコード失敗: {e}")))?;

    let quote_verified = match quote {
        Some(quote_b64) => {
            verify_peer_quote(&quote_b64, event_log.as_deref(), &nonce, local_mode)?;
            true
        }
        None => false,
    };

    let peer_public = decode_peer_key(&peer_key_b64)?;

    let local_secret = X25519StaticSecret::random_from_rng(OsRng);
    let local_public = X25519PublicKey::from(&local_secret);

    send_handshake(
        ws,
        &HandshakeMessage::AttestationResponse {
            peer_public_key: b64(local_public.as_bytes()),
        },
    )
    .await?;

    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    send_handshake(
        ws,
        &HandshakeMessage::AttestationOk {
            hkdf_salt: b64(&salt),
        },
    )
    .await?;

    let shared = ecdh_derive_shared_secret(&local_secret, &peer_public);
    let key = derive_session_key(&salt, &shared)?;
    debug!(peer_id, quote_verified, "ハンドシェイクを受理しました");
    Ok((
        AeadSession::new(key),
        HandshakeInfo {
            peer_id,
            quote_verified,
        },
    ))
}
