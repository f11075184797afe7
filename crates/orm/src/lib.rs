//! # Accord Protocol 構造化クエリモデル
//!
//! セキュアチャネル越しに実行される宣言的クエリとそのアクセス制御。
//!
//! - [`query`] — ワイヤ上を流れるクエリ表現（操作・フィルタ・集約）
//! - [`permissions`] — アローリストによる実行前検査
//! - [`client`] — チャネル越しにクエリを送るクライアントとビルダー
//! - [`server`] — 受信側のクエリ受理・検査・実行ディスパッチ

use accord_channel::ChannelError;

pub mod client;
pub mod permissions;
pub mod query;
pub mod server;

pub use client::{default_schema, OrmClient, QueryBuilder};
pub use permissions::{Grant, PermissionError, PermissionGuard, PermissionSet, TablePermission};
pub use query::{
    AggregateFunction, Aggregation, ColumnValue, FilterOperator, Operation, OrderBy, OrmQuery,
    QueryFilter, QueryResult, SortDirection,
};
pub use server::{ExecutionError, OrmServer, QueryExecutor};

/// クエリ層のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum OrmError {
    /// フィルタなしのUPDATE/DELETE（ローカル検証で拒否）
    #[error("フィルタなしの{0}は拒否されます")]
    MissingFilters(query::Operation),
    /// チャネル層の失敗
    #[error("チャネルエラー: {0}")]
    Channel(#[from] ChannelError),
    /// ピアが返したエラーメッセージ
    #[error("クエリがピアに拒否されました: {0}")]
    Remote(String),
    /// 応答メッセージの構造が要求応答の形式に合わない
    #[error("プロトコル違反: {0}")]
    Protocol(String),
}
