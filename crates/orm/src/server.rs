//! # クエリ受理側ディスパッチ
//!
//! 復号済みの `orm_query` メッセージを受け取り、パーミッション検査を
//! 通ったものだけを実行器に渡す。戻り値は常にJSONメッセージであり、
//! どんな失敗でも受信ループを止めない。

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::permissions::{PermissionGuard, PermissionSet};
use crate::query::{OrmQuery, QueryResult};

/// 実行器の失敗。メッセージはそのままピアに返される。
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// 検査済みクエリを実際に実行するバックエンド。
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &OrmQuery) -> Result<QueryResult, ExecutionError>;
}

/// クエリメッセージの受理・検査・実行を束ねるサーバ側コンポーネント。
pub struct OrmServer {
    permissions: PermissionSet,
    executor: Box<dyn QueryExecutor>,
}

impl OrmServer {
    pub fn new(permissions: PermissionSet, executor: Box<dyn QueryExecutor>) -> Self {
        Self {
            permissions,
            executor,
        }
    }

    /// 受信メッセージを処理し、応答メッセージを組み立てる。
    ///
    /// 相関ID（`query_id`）は応答にそのまま引き写される。
    pub async fn handle(&self, message: &Value) -> Value {
        let query_id = message.get("query_id").and_then(Value::as_str);

        let msg_type = message.get("type").and_then(Value::as_str).unwrap_or("");
        if msg_type != "orm_query" {
            return error_message(query_id, &format!("未対応のメッセージ種別: {msg_type}"));
        }

        let query = match message.get("query") {
            Some(raw) => match serde_json::from_value::<OrmQuery>(raw.clone()) {
                Ok(query) => query,
                Err(e) => return error_message(query_id, &format!("不正なクエリ: {e}")),
            },
            None => return error_message(query_id, "queryフィールドがありません"),
        };

        if let Err(e) = query.validate_local() {
            return error_message(query_id, &e.to_string());
        }

        if let Err(e) = PermissionGuard::validate(&query, &self.permissions) {
            warn!(table = %query.table, operation = %query.operation, "クエリを拒否: {e}");
            return error_message(query_id, &e.to_string());
        }

        match self.executor.execute(&query).await {
            Ok(result) => {
                info!(
                    table = %query.table,
                    operation = %query.operation,
                    row_count = result.row_count,
                    "クエリを実行しました"
                );
                let mut response = json!({"type": "orm_result", "result": result});
                if let (Some(obj), Some(id)) = (response.as_object_mut(), query_id) {
                    obj.insert("query_id".to_string(), Value::String(id.to_string()));
                }
                response
            }
            Err(e) => error_message(query_id, &e.to_string()),
        }
    }
}

fn error_message(query_id: Option<&str>, message: &str) -> Value {
    let mut response = json!({"type": "error", "message": message});
    if let (Some(obj), Some(id)) = (response.as_object_mut(), query_id) {
        obj.insert("query_id".to_string(), Value::String(id.to_string()));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{Grant, TablePermission};
    use crate::query::Operation;

    struct StaticExecutor(QueryResult);

    #[async_trait]
    impl QueryExecutor for StaticExecutor {
        async fn execute(&self, _query: &OrmQuery) -> Result<QueryResult, ExecutionError> {
            Ok(self.0.clone())
        }
    }

    fn test_server() -> OrmServer {
        let mut permissions = PermissionSet::new();
        permissions.insert(
            "scores",
            TablePermission {
                columns: None,
                operations: [Grant::Read].into_iter().collect(),
                max_rows: None,
                allow_aggregations: false,
            },
        );
        OrmServer::new(
            permissions,
            Box::new(StaticExecutor(QueryResult {
                rows: vec![],
                row_count: 0,
                execution_time_ms: 1,
            })),
        )
    }

    #[tokio::test]
    async fn test_handle_echoes_query_id() {
        let server = test_server();
        let query = serde_json::to_value(OrmQuery::new(Operation::Select, "scores")).unwrap();
        let response = server
            .handle(&json!({"type": "orm_query", "query_id": "abc123", "query": query}))
            .await;
        assert_eq!(response["type"], "orm_result");
        assert_eq!(response["query_id"], "abc123");
    }

    #[tokio::test]
    async fn test_handle_rejects_denied_table_as_error_message() {
        let server = test_server();
        let query = serde_json::to_value(OrmQuery::new(Operation::Select, "admin_logs")).unwrap();
        let response = server
            .handle(&json!({"type": "orm_query", "query_id": "q1", "query": query}))
            .await;
        assert_eq!(response["type"], "error");
        assert_eq!(response["query_id"], "q1");
        assert!(response["message"].as_str().unwrap().contains("admin_logs"));
    }

    #[tokio::test]
    async fn test_handle_rejects_unknown_message_type() {
        let server = test_server();
        let response = server.handle(&json!({"type": "ping"})).await;
        assert_eq!(response["type"], "error");
    }

    #[tokio::test]
    async fn test_handle_rejects_filterless_delete() {
        let mut permissions = PermissionSet::new();
        permissions.insert(
            "scores",
            TablePermission {
                columns: None,
                operations: [Grant::Delete].into_iter().collect(),
                max_rows: None,
                allow_aggregations: false,
            },
        );
        let server = OrmServer::new(
            permissions,
            Box::new(StaticExecutor(QueryResult {
                rows: vec![],
                row_count: 0,
                execution_time_ms: 0,
            })),
        );

        let query = serde_json::to_value(OrmQuery::new(Operation::Delete, "scores")).unwrap();
        let response = server
            .handle(&json!({"type": "orm_query", "query": query}))
            .await;
        assert_eq!(response["type"], "error");
    }
}
