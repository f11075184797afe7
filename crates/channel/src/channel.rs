//! # セキュアチャネル
//!
//! ハンドシェイク済みWebSocket接続の上で動く要求応答チャネル。
//!
//! 送信側は送出メッセージごとに相関ID（`query_id`）を採番して待機者を
//! 登録し、バックグラウンド受信ループが復号済み応答を相関IDで突合して
//! 配送する。相関IDを持たないメッセージは帯域外キューに積まれ、
//! [`SecureChannel::next_event`] で取り出せる。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use accord_crypto::AeadSession;
use accord_types::EncryptedEnvelope;

use crate::handshake::{initiate, QuoteSource};
use crate::{
    new_correlation_id, ChannelError, ATTESTATION_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
    RECEIVE_BACKOFF,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WriteHalf = SplitSink<WsStream, Message>;
type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<Value>>>>;

/// 相関IDで待機者に配送される応答メッセージの種別。
const CORRELATED_TYPES: [&str; 2] = ["orm_result", "error"];

/// チャネルのライフサイクル状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// TCP/WebSocket接続中
    Connecting,
    /// ハンドシェイク実行中
    Handshaking,
    /// 確立済み、送受信可能
    Open,
    /// クローズ処理中
    Closing,
    /// クローズ済み
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Handshaking => "handshaking",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// 確立済みの暗号化チャネル。
///
/// クローン不可。複数タスクから共有する場合は `Arc` で包む。
/// 送信はシンク側のMutexで直列化されるため `&self` で呼び出せる。
pub struct SecureChannel {
    write: Arc<Mutex<WriteHalf>>,
    session: Arc<AeadSession>,
    pending: PendingMap,
    events: Mutex<mpsc::UnboundedReceiver<Value>>,
    state: Arc<RwLock<ChannelState>>,
    receiver: JoinHandle<()>,
}

impl SecureChannel {
    /// WebSocket接続からハンドシェイクまでを行い、チャネルを確立する。
    ///
    /// ハンドシェイク全体には固定タイムアウトが適用される。
    /// いかなる失敗でもチャネルは確立せず、部分的に使える状態は残らない。
    pub async fn connect(
        url: &str,
        peer_id: &str,
        quote_source: Option<&dyn QuoteSource>,
    ) -> Result<Self, ChannelError> {
        let state = Arc::new(RwLock::new(ChannelState::Connecting));
        debug!(url, peer_id, "チャネル接続を開始します");
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        set_channel_state(&state, ChannelState::Handshaking);
        let session = tokio::time::timeout(
            ATTESTATION_TIMEOUT,
            initiate(&mut ws, peer_id, quote_source),
        )
        .await
        .map_err(|_| ChannelError::Timeout(ATTESTATION_TIMEOUT))??;
        set_channel_state(&state, ChannelState::Open);

        let (write, read) = ws.split();
        let write = Arc::new(Mutex::new(write));
        let session = Arc::new(session);
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(receive_loop(
            read,
            Arc::clone(&write),
            Arc::clone(&session),
            Arc::clone(&pending),
            event_tx,
            Arc::clone(&state),
        ));

        info!(peer_id, "セキュアチャネルを確立しました");
        Ok(Self {
            write,
            session,
            pending,
            events: Mutex::new(event_rx),
            state,
            receiver,
        })
    }

    /// 現在のチャネル状態。
    pub fn state(&self) -> ChannelState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// 応答待ちの件数。
    pub fn pending_requests(&self) -> usize {
        match self.pending.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// メッセージを送信し、同じ相関IDを持つ応答を待つ。
    ///
    /// デフォルトタイムアウト（30秒）版。
    pub async fn send_message(&self, message: Value) -> Result<Value, ChannelError> {
        self.send_message_with_timeout(message, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// メッセージを送信し、同じ相関IDを持つ応答を待つ（タイムアウト指定版）。
    ///
    /// 送出前に新しい相関IDを採番して `query_id` フィールドに付与する。
    /// タイムアウト時は待機者を登録から除去してから失敗を返すため、
    /// 同じIDを再利用した後続メッセージが誤配送されることはない。
    pub async fn send_message_with_timeout(
        &self,
        mut message: Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(ChannelError::NotOpen(state));
        }

        let query_id = new_correlation_id();
        match message.as_object_mut() {
            Some(obj) => {
                obj.insert("query_id".to_string(), Value::String(query_id.clone()));
            }
            None => {
                return Err(ChannelError::Protocol(
                    "送信メッセージはJSONオブジェクトである必要があります".to_string(),
                ));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.register_waiter(&query_id, tx);

        let envelope = match self.session.encrypt(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.remove_waiter(&query_id);
                return Err(e.into());
            }
        };
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                self.remove_waiter(&query_id);
                return Err(ChannelError::Protocol(format!("シリアライズ失敗: {e}")));
            }
        };

        if let Err(e) = self.write.lock().await.send(Message::Text(text)).await {
            self.remove_waiter(&query_id);
            return Err(ChannelError::Transport(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ChannelError::Transport(
                "応答待ちがチャネルクローズにより破棄されました".to_string(),
            )),
            Err(_) => {
                self.remove_waiter(&query_id);
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// 帯域外メッセージ（相関IDに紐づかない受信メッセージ）を取り出す。
    ///
    /// キューが空でチャネルが生きている間は待機する。受信ループ終了後に
    /// キューが空になると `None` を返す。
    pub async fn next_event(&self) -> Option<Value> {
        self.events.lock().await.recv().await
    }

    /// チャネルをクローズする。
    ///
    /// 受信ループを停止し、Closeフレームの送出を試みる。送出済みの
    /// 応答待ちは強制解決せず、各自のタイムアウトに委ねる。
    pub async fn close(&self) {
        self.set_state(ChannelState::Closing);
        self.receiver.abort();
        if let Err(e) = self.write.lock().await.send(Message::Close(None)).await {
            debug!("Closeフレーム送出に失敗（無視）: {e}");
        }
        self.set_state(ChannelState::Closed);
        info!("セキュアチャネルをクローズしました");
    }

    fn set_state(&self, next: ChannelState) {
        set_channel_state(&self.state, next);
    }

    fn register_waiter(&self, query_id: &str, tx: oneshot::Sender<Value>) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.insert(query_id.to_string(), tx);
    }

    fn remove_waiter(&self, query_id: &str) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.remove(query_id);
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// 共有状態を次の状態に遷移させる。ロック汚染時も遷移は行う。
fn set_channel_state(state: &Arc<RwLock<ChannelState>>, next: ChannelState) {
    match state.write() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

/// バックグラウンド受信ループ。
///
/// フレームを復号し、相関IDを持つ応答は待機者へ、それ以外は帯域外
/// キューへ配送する。復号失敗などの非致命的エラーではフレームを破棄し、
/// 短いバックオフの後に受信を継続する。ストリーム終端・Closeフレームで
/// 終了し、チャネル状態をClosedに遷移させる。
async fn receive_loop(
    mut read: SplitStream<WsStream>,
    write: Arc<Mutex<WriteHalf>>,
    session: Arc<AeadSession>,
    pending: PendingMap,
    events: mpsc::UnboundedSender<Value>,
    state: Arc<RwLock<ChannelState>>,
) {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match decrypt_frame(&session, &text) {
                Ok(message) => dispatch(message, &pending, &events),
                Err(e) => {
                    warn!("受信フレームの処理に失敗（破棄して継続）: {e}");
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                if let Err(e) = write.lock().await.send(Message::Pong(payload)).await {
                    warn!("Pong送出に失敗: {e}");
                }
            }
            Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                warn!("バイナリフレームは未対応のため破棄します");
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!("ピアが接続をクローズしました");
                break;
            }
            Some(Err(e)) => {
                warn!("受信エラー（バックオフ後に継続）: {e}");
                tokio::time::sleep(RECEIVE_BACKOFF).await;
            }
        }
    }

    set_channel_state(&state, ChannelState::Closed);
}

/// 暗号化エンベロープをパースして復号する。
fn decrypt_frame(session: &AeadSession, text: &str) -> Result<Value, ChannelError> {
    let envelope: EncryptedEnvelope = serde_json::from_str(text)
        .map_err(|e| ChannelError::Protocol(format!("エンベロープのパース失敗: {e}")))?;
    Ok(session.decrypt(&envelope)?)
}

/// 復号済みメッセージを待機者または帯域外キューへ配送する。
///
/// 応答種別かつ登録済み相関IDを持つ場合のみ待機者に渡す。待機者が
/// 既にタイムアウトで除去されている場合（ID不在）は帯域外扱いになる。
fn dispatch(message: Value, pending: &PendingMap, events: &mpsc::UnboundedSender<Value>) {
    let is_response = message
        .get("type")
        .and_then(Value::as_str)
        .map_or(false, |t| CORRELATED_TYPES.contains(&t));
    let query_id = message
        .get("query_id")
        .and_then(Value::as_str)
        .map(str::to_owned);

    if let (true, Some(query_id)) = (is_response, query_id) {
        let waiter = {
            let mut guard = match pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.remove(&query_id)
        };
        if let Some(tx) = waiter {
            // 待機者側がタイムアウト直後に受信側を落としていても無害
            let _ = tx.send(message);
            return;
        }
        debug!(query_id, "対応する待機者のない応答を帯域外に回します");
    }
    if events.send(message).is_err() {
        debug!("帯域外キューの受信側が破棄済みのためメッセージを破棄します");
    }
}
