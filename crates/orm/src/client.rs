//! # ORMクライアント
//!
//! 確立済みセキュアチャネルの上で構造化クエリを実行する。
//! スキーマ未指定のクエリにはテナント既定スキーマ
//! （`challenge_{tenant_id}`）が補完される。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use accord_channel::SecureChannel;

use crate::query::{
    AggregateFunction, ColumnValue, FilterOperator, Operation, OrmQuery, QueryFilter, QueryResult,
    SortDirection,
};
use crate::OrmError;

/// テナントIDから既定スキーマ名を導出する。
///
/// 英数字以外の文字はすべて `_` に正規化される。
pub fn default_schema(tenant_id: &str) -> String {
    let normalized: String = tenant_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("challenge_{normalized}")
}

/// クエリに対するピアの応答。これ以外の形はプロトコル違反。
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OrmResponse {
    OrmResult { result: QueryResult },
    Error { message: String },
}

/// セキュアチャネル越しのクエリクライアント。
pub struct OrmClient {
    channel: Arc<SecureChannel>,
    schema: String,
}

impl OrmClient {
    pub fn new(channel: Arc<SecureChannel>, tenant_id: &str) -> Self {
        Self {
            channel,
            schema: default_schema(tenant_id),
        }
    }

    /// このクライアントが補完する既定スキーマ名。
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// クエリビルダーを開始する。
    pub fn query(&self, table: impl Into<String>) -> QueryBuilder<'_> {
        QueryBuilder {
            client: self,
            query: OrmQuery::new(Operation::Select, table),
        }
    }

    /// クエリを送信し、結果またはピアのエラーを返す。
    pub async fn execute(&self, mut query: OrmQuery) -> Result<QueryResult, OrmError> {
        query.validate_local()?;
        if query.schema.is_none() {
            query.schema = Some(self.schema.clone());
        }

        debug!(operation = %query.operation, table = %query.table, "クエリを送信します");
        let message = json!({"type": "orm_query", "query": query});
        let response = self.channel.send_message(message).await?;

        match serde_json::from_value::<OrmResponse>(response) {
            Ok(OrmResponse::OrmResult { result }) => Ok(result),
            Ok(OrmResponse::Error { message }) => Err(OrmError::Remote(message)),
            Err(e) => Err(OrmError::Protocol(format!(
                "応答がorm_result/errorのいずれでもありません: {e}"
            ))),
        }
    }

    /// 単純なSELECT。
    pub async fn select(
        &self,
        table: &str,
        columns: Option<Vec<String>>,
        filters: Vec<QueryFilter>,
    ) -> Result<QueryResult, OrmError> {
        let mut query = OrmQuery::new(Operation::Select, table);
        query.columns = columns;
        query.filters = filters;
        self.execute(query).await
    }

    /// 行数を数える。結果は `count` カラム1行で返る。
    pub async fn count(&self, table: &str, filters: Vec<QueryFilter>) -> Result<u64, OrmError> {
        let mut query = OrmQuery::new(Operation::Count, table);
        query.filters = filters;
        query.add_aggregation(AggregateFunction::Count, "*", Some("count".to_string()));

        let result = self.execute(query).await?;
        result
            .rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                OrmError::Protocol("count結果にcountカラムがありません".to_string())
            })
    }

    /// 1行挿入する。
    pub async fn insert(
        &self,
        table: &str,
        values: Vec<ColumnValue>,
    ) -> Result<QueryResult, OrmError> {
        let mut query = OrmQuery::new(Operation::Insert, table);
        query.values = Some(values);
        self.execute(query).await
    }

    /// フィルタに一致する行を更新する。フィルタなしはローカルで拒否。
    pub async fn update(
        &self,
        table: &str,
        set_values: Vec<ColumnValue>,
        filters: Vec<QueryFilter>,
    ) -> Result<QueryResult, OrmError> {
        let mut query = OrmQuery::new(Operation::Update, table);
        query.set_values = Some(set_values);
        query.filters = filters;
        self.execute(query).await
    }

    /// フィルタに一致する行を削除する。フィルタなしはローカルで拒否。
    pub async fn delete(
        &self,
        table: &str,
        filters: Vec<QueryFilter>,
    ) -> Result<QueryResult, OrmError> {
        let mut query = OrmQuery::new(Operation::Delete, table);
        query.filters = filters;
        self.execute(query).await
    }
}

/// SELECT系クエリの流暢なビルダー。
pub struct QueryBuilder<'a> {
    client: &'a OrmClient,
    query: OrmQuery,
}

impl QueryBuilder<'_> {
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.query.columns = Some(columns);
        self
    }

    pub fn filter(mut self, column: &str, operator: FilterOperator, value: Value) -> Self {
        self.query.add_filter(column, operator, value);
        self
    }

    pub fn order_by(mut self, column: &str, direction: SortDirection) -> Self {
        self.query.add_order(column, direction);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.query.offset = Some(offset);
        self
    }

    pub fn aggregate(mut self, function: AggregateFunction, column: &str, alias: &str) -> Self {
        self.query
            .add_aggregation(function, column, Some(alias.to_string()));
        self
    }

    pub async fn execute(self) -> Result<QueryResult, OrmError> {
        self.client.execute(self.query).await
    }
}
