//! # Accord Protocol ライフサイクルハンドラ実行基盤
//!
//! チャレンジ側アプリケーションが登録する名前付きハンドラの台帳。
//! 同期・非同期の両方のハンドラを受け付け、呼び出し側には統一された
//! 非同期インターフェースを見せる。
//!
//! 実行基盤の設定は一度だけ構築し、以後は参照で引き回す。
//! グローバルな可変状態は持たない。

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use serde_json::Value;

/// ハンドラ実行のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// 登録されていないハンドラ名
    #[error("未登録のハンドラ: {0}")]
    UnknownHandler(String),
    /// ハンドラ本体の失敗
    #[error("ハンドラの実行に失敗: {0}")]
    HandlerFailed(String),
}

/// ハンドラ呼び出し時に渡される実行コンテキスト。
#[derive(Debug, Clone)]
pub struct JobContext {
    /// この呼び出しの識別子
    pub job_id: String,
    /// 所属するチャレンジの識別子
    pub challenge_id: String,
    /// 呼び出し元ピアの識別子
    pub peer_id: String,
    /// ハンドラへの入力ペイロード
    pub payload: Value,
}

type SyncHandlerFn = Box<dyn Fn(&JobContext) -> Result<Value, RuntimeError> + Send + Sync>;
type AsyncHandlerFn =
    Box<dyn Fn(JobContext) -> BoxFuture<'static, Result<Value, RuntimeError>> + Send + Sync>;

/// 登録可能なハンドラ。同期・非同期のどちらでも登録できる。
pub enum Handler {
    Sync(SyncHandlerFn),
    Async(AsyncHandlerFn),
}

impl Handler {
    /// ハンドラの種別によらず統一された非同期呼び出し。
    pub async fn invoke(&self, context: JobContext) -> Result<Value, RuntimeError> {
        match self {
            Handler::Sync(f) => f(&context),
            Handler::Async(f) => f(context).await,
        }
    }
}

/// 名前からハンドラへの台帳。
///
/// 構築後は不変として扱い、共有する場合は `Arc` で包む。
/// 複数インスタンスは互いに独立で、状態を共有しない。
#[derive(Default)]
pub struct RuntimeConfig {
    handlers: HashMap<String, Handler>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同期ハンドラを登録する。同名の既存登録は置き換えられる。
    pub fn register_sync<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&JobContext) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        self.handlers
            .insert(name.into(), Handler::Sync(Box::new(handler)));
        self
    }

    /// 非同期ハンドラを登録する。同名の既存登録は置き換えられる。
    pub fn register_async<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(JobContext) -> BoxFuture<'static, Result<Value, RuntimeError>> + Send + Sync + 'static,
    {
        self.handlers
            .insert(name.into(), Handler::Async(Box::new(handler)));
        self
    }

    /// 登録済みハンドラ名の一覧。
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// 名前でハンドラを呼び出す。
    pub async fn invoke(&self, name: &str, context: JobContext) -> Result<Value, RuntimeError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownHandler(name.to_string()))?;
        handler.invoke(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(payload: Value) -> JobContext {
        JobContext {
            job_id: "job-1".to_string(),
            challenge_id: "challenge-1".to_string(),
            peer_id: "platform-api".to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_sync_and_async_handlers_share_interface() {
        let mut config = RuntimeConfig::new();
        config.register_sync("double", |ctx| {
            let n = ctx.payload["n"].as_i64().unwrap_or(0);
            Ok(json!({"result": n * 2}))
        });
        config.register_async("echo", |ctx| {
            Box::pin(async move { Ok(json!({"echo": ctx.payload})) })
        });

        let doubled = config.invoke("double", context(json!({"n": 21}))).await.unwrap();
        assert_eq!(doubled["result"], 42);

        let echoed = config.invoke("echo", context(json!("ping"))).await.unwrap();
        assert_eq!(echoed["echo"], "ping");
    }

    #[tokio::test]
    async fn test_unknown_handler_rejected() {
        let config = RuntimeConfig::new();
        let result = config.invoke("missing", context(json!(null))).await;
        assert!(matches!(result, Err(RuntimeError::UnknownHandler(_))));
    }

    #[tokio::test]
    async fn test_handler_failure_is_propagated() {
        let mut config = RuntimeConfig::new();
        config.register_sync("fail", |_| {
            Err(RuntimeError::HandlerFailed("計算不能".to_string()))
        });
        let result = config.invoke("fail", context(json!(null))).await;
        assert!(matches!(result, Err(RuntimeError::HandlerFailed(_))));
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let mut a = RuntimeConfig::new();
        a.register_sync("only_in_a", |_| Ok(json!(1)));
        let b = RuntimeConfig::new();

        assert!(a.invoke("only_in_a", context(json!(null))).await.is_ok());
        assert!(matches!(
            b.invoke("only_in_a", context(json!(null))).await,
            Err(RuntimeError::UnknownHandler(_))
        ));
    }

    #[tokio::test]
    async fn test_registration_replaces_existing_handler() {
        let mut config = RuntimeConfig::new();
        config.register_sync("h", |_| Ok(json!("first")));
        config.register_sync("h", |_| Ok(json!("second")));
        let result = config.invoke("h", context(json!(null))).await.unwrap();
        assert_eq!(result, json!("second"));
    }
}
