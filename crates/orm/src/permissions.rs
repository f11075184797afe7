//! # パーミッション検証
//!
//! クエリ実行前のアローリスト検査。ワイルドカード（`*`）エントリと
//! テーブル個別エントリは独立に評価され、操作ごとに許可の和を取る。
//! 宣言されていないテーブル・カラムへのアクセス、集約フラグのない
//! テーブルへの集約、上限を超えるLIMITはすべて拒否される。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::query::{Operation, OrmQuery};

/// 全テーブルに適用されるワイルドカードエントリのキー。
pub const WILDCARD_TABLE: &str = "*";

/// 操作グラント。readはselectとcountの両方を包含する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grant {
    Read,
    Insert,
    Update,
    Delete,
}

impl Grant {
    /// クエリ操作を対応するグラントに写す。
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Select | Operation::Count => Grant::Read,
            Operation::Insert => Grant::Insert,
            Operation::Update => Grant::Update,
            Operation::Delete => Grant::Delete,
        }
    }
}

/// 1テーブル分のパーミッション宣言。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TablePermission {
    /// アクセス可能なカラム。`None` は全カラム許可
    #[serde(default)]
    pub columns: Option<HashSet<String>>,
    /// 許可される操作グラント
    #[serde(default)]
    pub operations: HashSet<Grant>,
    /// LIMITの上限。`None` は無制限
    #[serde(default)]
    pub max_rows: Option<u64>,
    /// 集約クエリを許可するか
    #[serde(default)]
    pub allow_aggregations: bool,
}

impl TablePermission {
    fn allows_column(&self, column: &str) -> bool {
        match &self.columns {
            None => true,
            Some(set) => set.contains(column),
        }
    }
}

/// テーブル名からパーミッション宣言への写像。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    tables: HashMap<String, TablePermission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// テーブルのパーミッションを宣言する。`*` でワイルドカード。
    pub fn insert(&mut self, table: impl Into<String>, permission: TablePermission) -> &mut Self {
        self.tables.insert(table.into(), permission);
        self
    }

    fn specific(&self, table: &str) -> Option<&TablePermission> {
        self.tables.get(table)
    }

    fn wildcard(&self) -> Option<&TablePermission> {
        self.tables.get(WILDCARD_TABLE)
    }

    /// テーブルが（個別またはワイルドカードで）宣言されているか。
    pub fn declares(&self, table: &str) -> bool {
        self.specific(table).is_some() || self.wildcard().is_some()
    }

    /// 個別エントリとワイルドカードの和でグラントを判定する。
    pub fn grants(&self, table: &str, grant: Grant) -> bool {
        let specific = self
            .specific(table)
            .map_or(false, |p| p.operations.contains(&grant));
        let wildcard = self
            .wildcard()
            .map_or(false, |p| p.operations.contains(&grant));
        specific || wildcard
    }

    /// 個別エントリとワイルドカードの和でカラムアクセスを判定する。
    pub fn allows_column(&self, table: &str, column: &str) -> bool {
        let specific = self.specific(table).map_or(false, |p| p.allows_column(column));
        let wildcard = self.wildcard().map_or(false, |p| p.allows_column(column));
        specific || wildcard
    }

    /// 個別エントリとワイルドカードの和で集約可否を判定する。
    pub fn allows_aggregations(&self, table: &str) -> bool {
        let specific = self.specific(table).map_or(false, |p| p.allow_aggregations);
        let wildcard = self.wildcard().map_or(false, |p| p.allow_aggregations);
        specific || wildcard
    }

    /// 有効なLIMIT上限。個別エントリの宣言をワイルドカードより優先する。
    pub fn max_rows(&self, table: &str) -> Option<u64> {
        self.specific(table)
            .and_then(|p| p.max_rows)
            .or_else(|| self.wildcard().and_then(|p| p.max_rows))
    }
}

/// パーミッション検査の拒否理由。
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("テーブルへのアクセスが許可されていません: {0}")]
    TableNotAllowed(String),
    #[error("テーブル {table} に対する {grant:?} 操作は許可されていません")]
    OperationNotAllowed { table: String, grant: Grant },
    #[error("テーブル {table} のカラム {column} へのアクセスは許可されていません")]
    ColumnNotAllowed { table: String, column: String },
    #[error("テーブル {0} への集約クエリは許可されていません")]
    AggregationNotAllowed(String),
    #[error("LIMIT {limit} がテーブル {table} の上限 {max_rows} を超えています")]
    LimitExceeded {
        table: String,
        limit: u64,
        max_rows: u64,
    },
}

/// クエリをパーミッション宣言に照らして検査する。
pub struct PermissionGuard;

impl PermissionGuard {
    /// クエリが触れる全カラムを列挙する。
    fn referenced_columns(query: &OrmQuery) -> impl Iterator<Item = &str> {
        let projection = query.columns.iter().flatten().map(String::as_str);
        let filters = query.filters.iter().map(|f| f.column.as_str());
        let orders = query.order_by.iter().map(|o| o.column.as_str());
        let aggregations = query
            .aggregations
            .iter()
            .map(|a| a.column.as_str())
            // COUNT(*)の全行指定はカラム参照ではない
            .filter(|c| *c != "*");
        let values = query.values.iter().flatten().map(|v| v.column.as_str());
        let set_values = query.set_values.iter().flatten().map(|v| v.column.as_str());
        projection
            .chain(filters)
            .chain(orders)
            .chain(aggregations)
            .chain(values)
            .chain(set_values)
    }

    /// 検査本体。最初に見つかった違反で失敗する。
    pub fn validate(query: &OrmQuery, permissions: &PermissionSet) -> Result<(), PermissionError> {
        let table = query.table.as_str();

        if !permissions.declares(table) {
            return Err(PermissionError::TableNotAllowed(table.to_string()));
        }

        let grant = Grant::for_operation(query.operation);
        if !permissions.grants(table, grant) {
            return Err(PermissionError::OperationNotAllowed {
                table: table.to_string(),
                grant,
            });
        }

        for column in Self::referenced_columns(query) {
            if !permissions.allows_column(table, column) {
                return Err(PermissionError::ColumnNotAllowed {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
        }

        if !query.aggregations.is_empty() && !permissions.allows_aggregations(table) {
            return Err(PermissionError::AggregationNotAllowed(table.to_string()));
        }

        if let (Some(limit), Some(max_rows)) = (query.limit, permissions.max_rows(table)) {
            // 上限超過は切り詰めではなく拒否
            if limit > max_rows {
                return Err(PermissionError::LimitExceeded {
                    table: table.to_string(),
                    limit,
                    max_rows,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{AggregateFunction, FilterOperator};
    use serde_json::json;

    fn read_only(columns: &[&str], max_rows: Option<u64>) -> TablePermission {
        TablePermission {
            columns: Some(columns.iter().map(|c| c.to_string()).collect()),
            operations: [Grant::Read].into_iter().collect(),
            max_rows,
            allow_aggregations: false,
        }
    }

    #[test]
    fn test_undeclared_table_rejected() {
        let mut permissions = PermissionSet::new();
        permissions.insert("scores", read_only(&["id"], None));

        let query = OrmQuery::new(Operation::Select, "admin_logs");
        assert!(matches!(
            PermissionGuard::validate(&query, &permissions),
            Err(PermissionError::TableNotAllowed(_))
        ));
    }

    #[test]
    fn test_wildcard_and_specific_grants_are_unioned() {
        // ワイルドカードがreadを、個別エントリがinsertを与える
        let mut permissions = PermissionSet::new();
        permissions.insert(
            WILDCARD_TABLE,
            TablePermission {
                columns: None,
                operations: [Grant::Read].into_iter().collect(),
                max_rows: None,
                allow_aggregations: false,
            },
        );
        permissions.insert(
            "scores",
            TablePermission {
                columns: None,
                operations: [Grant::Insert].into_iter().collect(),
                max_rows: None,
                allow_aggregations: false,
            },
        );

        let select = OrmQuery::new(Operation::Select, "scores");
        assert!(PermissionGuard::validate(&select, &permissions).is_ok());

        let insert = OrmQuery::new(Operation::Insert, "scores");
        assert!(PermissionGuard::validate(&insert, &permissions).is_ok());

        // 個別エントリのinsertはワイルドカードのない他操作を含意しない
        let delete = OrmQuery::new(Operation::Delete, "scores");
        assert!(matches!(
            PermissionGuard::validate(&delete, &permissions),
            Err(PermissionError::OperationNotAllowed { .. })
        ));
    }

    #[test]
    fn test_insert_grant_does_not_imply_read() {
        let mut permissions = PermissionSet::new();
        permissions.insert(
            "scores",
            TablePermission {
                columns: None,
                operations: [Grant::Insert].into_iter().collect(),
                max_rows: None,
                allow_aggregations: false,
            },
        );

        let select = OrmQuery::new(Operation::Select, "scores");
        assert!(matches!(
            PermissionGuard::validate(&select, &permissions),
            Err(PermissionError::OperationNotAllowed {
                grant: Grant::Read,
                ..
            })
        ));
    }

    #[test]
    fn test_undeclared_column_rejected_everywhere() {
        let mut permissions = PermissionSet::new();
        permissions.insert("scores", read_only(&["id", "score"], None));

        // 射影カラム
        let mut query = OrmQuery::new(Operation::Select, "scores");
        query.columns = Some(vec!["secret".to_string()]);
        assert!(matches!(
            PermissionGuard::validate(&query, &permissions),
            Err(PermissionError::ColumnNotAllowed { .. })
        ));

        // フィルタカラム
        let mut query = OrmQuery::new(Operation::Select, "scores");
        query.add_filter("secret", FilterOperator::Eq, json!(1));
        assert!(matches!(
            PermissionGuard::validate(&query, &permissions),
            Err(PermissionError::ColumnNotAllowed { .. })
        ));

        // 許可済みカラムのみなら通る
        let mut query = OrmQuery::new(Operation::Select, "scores");
        query.columns = Some(vec!["id".to_string(), "score".to_string()]);
        assert!(PermissionGuard::validate(&query, &permissions).is_ok());
    }

    #[test]
    fn test_aggregation_requires_flag() {
        let mut permissions = PermissionSet::new();
        permissions.insert("scores", read_only(&["score"], None));

        let mut query = OrmQuery::new(Operation::Select, "scores");
        query.add_aggregation(AggregateFunction::Sum, "score", None);
        assert!(matches!(
            PermissionGuard::validate(&query, &permissions),
            Err(PermissionError::AggregationNotAllowed(_))
        ));

        let mut allowed = read_only(&["score"], None);
        allowed.allow_aggregations = true;
        permissions.insert("scores", allowed);
        assert!(PermissionGuard::validate(&query, &permissions).is_ok());
    }

    #[test]
    fn test_limit_exceeding_max_rows_rejected_not_clamped() {
        let mut permissions = PermissionSet::new();
        permissions.insert("scores", read_only(&["id"], Some(100)));

        let mut query = OrmQuery::new(Operation::Select, "scores");
        query.limit = Some(101);
        assert!(matches!(
            PermissionGuard::validate(&query, &permissions),
            Err(PermissionError::LimitExceeded {
                limit: 101,
                max_rows: 100,
                ..
            })
        ));

        query.limit = Some(100);
        assert!(PermissionGuard::validate(&query, &permissions).is_ok());
    }

    #[test]
    fn test_count_star_is_not_a_column_reference() {
        let mut permissions = PermissionSet::new();
        let mut perm = read_only(&["id"], None);
        perm.allow_aggregations = true;
        permissions.insert("scores", perm);

        let mut query = OrmQuery::new(Operation::Count, "scores");
        query.add_aggregation(AggregateFunction::Count, "*", None);
        assert!(PermissionGuard::validate(&query, &permissions).is_ok());
    }
}
