//! # 構造化クエリモデル
//!
//! SQL文字列の代わりにワイヤ上を流れる宣言的なクエリ表現。
//! 演算子・集約関数は閉じた集合であり、未知の値はデシリアライズの
//! 時点で拒否される。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::OrmError;

/// クエリ操作の種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Select,
    Count,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Select => "select",
            Operation::Count => "count",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// フィルタ演算子の閉じた集合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "IN")]
    In,
}

/// WHERE句の1条件。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFilter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: Value,
}

/// ソート方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

/// ORDER BY句の1指定。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

/// 集約関数の閉じた集合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// 集約指定。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// INSERT/UPDATEで使うカラムと値の組。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnValue {
    pub column: String,
    pub value: Value,
}

/// ワイヤ上を流れる構造化クエリ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrmQuery {
    pub operation: Operation,
    pub table: String,
    /// 省略時は送信側でテナント既定スキーマが補完される
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// SELECTの射影カラム。省略時は全カラム
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<QueryFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Aggregation>,
    /// INSERTの挿入値
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ColumnValue>>,
    /// UPDATEの更新値
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_values: Option<Vec<ColumnValue>>,
}

impl OrmQuery {
    /// 指定操作の空クエリを作る。
    pub fn new(operation: Operation, table: impl Into<String>) -> Self {
        Self {
            operation,
            table: table.into(),
            schema: None,
            columns: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            aggregations: Vec::new(),
            values: None,
            set_values: None,
        }
    }

    pub fn add_filter(
        &mut self,
        column: impl Into<String>,
        operator: FilterOperator,
        value: Value,
    ) -> &mut Self {
        self.filters.push(QueryFilter {
            column: column.into(),
            operator,
            value,
        });
        self
    }

    pub fn add_order(&mut self, column: impl Into<String>, direction: SortDirection) -> &mut Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn add_aggregation(
        &mut self,
        function: AggregateFunction,
        column: impl Into<String>,
        alias: Option<String>,
    ) -> &mut Self {
        self.aggregations.push(Aggregation {
            function,
            column: column.into(),
            alias,
        });
        self
    }

    /// ネットワークに出す前のローカル検証。
    ///
    /// フィルタなしのUPDATE/DELETE（全行更新・全行削除）はピアに
    /// 送らずに拒否する。
    pub fn validate_local(&self) -> Result<(), OrmError> {
        if matches!(self.operation, Operation::Update | Operation::Delete)
            && self.filters.is_empty()
        {
            return Err(OrmError::MissingFilters(self.operation));
        }
        Ok(())
    }
}

/// クエリ実行結果。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub rows: Vec<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub execution_time_ms: u64,
}
