//! ORMクライアントとサーバ側ディスパッチの統合テスト。
//!
//! モックピアはハンドシェイク受理後、復号したクエリを [`OrmServer`] に
//! 通して応答を返す。クライアント側はセキュアチャネル越しに実行する。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use accord_channel::{handshake, SecureChannel};
use accord_orm::{
    ColumnValue, ExecutionError, FilterOperator, Grant, OrmClient, OrmError, OrmQuery, OrmServer,
    PermissionSet, QueryExecutor, QueryFilter, QueryResult, SortDirection, TablePermission,
};
use accord_types::{EncryptedEnvelope, EnvironmentMode};

/// 固定の行集合を返すスタブ実行器。
struct StubExecutor;

#[async_trait]
impl QueryExecutor for StubExecutor {
    async fn execute(&self, query: &OrmQuery) -> Result<QueryResult, ExecutionError> {
        // スキーマが補完されていることを実行器の位置で確認する
        assert_eq!(query.schema.as_deref(), Some("challenge_tenant_a"));

        let mut row = Map::new();
        match query.operation {
            accord_orm::Operation::Count => {
                row.insert("count".to_string(), json!(7));
            }
            _ => {
                row.insert("id".to_string(), json!(1));
                row.insert("score".to_string(), json!(950));
            }
        }
        Ok(QueryResult {
            rows: vec![row],
            row_count: 1,
            execution_time_ms: 2,
        })
    }
}

fn test_permissions() -> PermissionSet {
    let mut permissions = PermissionSet::new();
    permissions.insert(
        "scores",
        TablePermission {
            columns: Some(["id", "score", "round"].map(String::from).into_iter().collect()),
            operations: [Grant::Read, Grant::Insert, Grant::Update]
                .into_iter()
                .collect(),
            max_rows: Some(100),
            allow_aggregations: true,
        },
    );
    permissions
}

/// OrmServerを組み込んだモックピアを起動する。
async fn spawn_orm_peer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let (session, _) = handshake::accept(&mut ws, EnvironmentMode::Dev)
            .await
            .unwrap();
        let server = OrmServer::new(test_permissions(), Box::new(StubExecutor));

        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else { continue };
            let envelope: EncryptedEnvelope = serde_json::from_str(&text).unwrap();
            let request = session.decrypt(&envelope).unwrap();
            let response = server.handle(&request).await;
            let reply = session.encrypt(&response).unwrap();
            ws.send(Message::Text(serde_json::to_string(&reply).unwrap()))
                .await
                .unwrap();
        }
    });
    format!("ws://{addr}")
}

async fn connect_client(url: &str) -> OrmClient {
    let channel = SecureChannel::connect(url, "platform-api", None)
        .await
        .unwrap();
    OrmClient::new(Arc::new(channel), "tenant-a")
}

#[tokio::test]
async fn test_select_roundtrip_with_builder() {
    let url = spawn_orm_peer().await;
    let client = connect_client(&url).await;

    let result = client
        .query("scores")
        .columns(vec!["id".to_string(), "score".to_string()])
        .filter("round", FilterOperator::Ge, json!(3))
        .order_by("score", SortDirection::Desc)
        .limit(10)
        .execute()
        .await
        .unwrap();

    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0]["score"], json!(950));
}

#[tokio::test]
async fn test_count_extracts_count_column() {
    let url = spawn_orm_peer().await;
    let client = connect_client(&url).await;

    let count = client.count("scores", vec![]).await.unwrap();
    assert_eq!(count, 7);
}

#[tokio::test]
async fn test_denied_table_surfaces_remote_error() {
    let url = spawn_orm_peer().await;
    let client = connect_client(&url).await;

    let result = client.select("admin_logs", None, vec![]).await;
    match result {
        Err(OrmError::Remote(message)) => assert!(message.contains("admin_logs")),
        other => panic!("Remoteエラーを期待: {other:?}"),
    }
}

#[tokio::test]
async fn test_limit_over_max_rows_rejected_remotely() {
    let url = spawn_orm_peer().await;
    let client = connect_client(&url).await;

    let result = client.query("scores").limit(1000).execute().await;
    assert!(matches!(result, Err(OrmError::Remote(_))));
}

#[tokio::test]
async fn test_filterless_update_never_reaches_the_wire() {
    let url = spawn_orm_peer().await;
    let client = connect_client(&url).await;

    // ローカル検証で落ちるため、ピアにはフレームが届かない
    let result = client
        .update(
            "scores",
            vec![ColumnValue {
                column: "score".to_string(),
                value: json!(0),
            }],
            vec![],
        )
        .await;
    assert!(matches!(
        result,
        Err(OrmError::MissingFilters(accord_orm::Operation::Update))
    ));

    // チャネル自体は引き続き使える
    let filters = vec![QueryFilter {
        column: "id".to_string(),
        operator: FilterOperator::Eq,
        value: json!(1),
    }];
    assert!(client.select("scores", None, filters).await.is_ok());
}
