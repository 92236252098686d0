//! Request and response messages.
//!
//! Every transaction operation has one request kind. Transaction and block
//! identifiers are chosen by the client; frame identifiers pair each response
//! with its request, since responses for different transactions may arrive
//! in any order.

use dbspool::{Dialect, ParamStyle, Row, Value};
use serde::{Deserialize, Serialize};

/// A request with its frame identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Frame identifier, echoed in the response.
    pub id: u64,
    /// The request.
    pub request: Request,
}

/// A response with the identifier of the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Identifier of the answered request.
    pub id: u64,
    /// The response.
    pub response: Response,
}

/// Operations a client can ask for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Start a transaction under the given identifier.
    StartTxn {
        /// Transaction identifier.
        txn: u64,
    },
    /// Execute a statement, directly or inside a command block.
    ExecSql {
        /// Transaction identifier.
        txn: u64,
        /// Command block, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block: Option<u64>,
        /// SQL text.
        sql: String,
        /// Bind parameters.
        #[serde(default)]
        params: Vec<Value>,
        /// Whether producing no rows is a failure.
        #[serde(default)]
        expect_rows: bool,
    },
    /// Commit a transaction.
    Commit {
        /// Transaction identifier.
        txn: u64,
    },
    /// Abort a transaction.
    Abort {
        /// Transaction identifier.
        txn: u64,
    },
    /// Open a command block under the given identifier.
    OpenBlock {
        /// Transaction identifier.
        txn: u64,
        /// Block identifier.
        block: u64,
    },
    /// End a command block.
    EndBlock {
        /// Transaction identifier.
        txn: u64,
        /// Block identifier.
        block: u64,
    },
}

impl Request {
    /// The transaction this request refers to.
    #[must_use]
    pub fn txn(&self) -> u64 {
        match self {
            Self::StartTxn { txn }
            | Self::ExecSql { txn, .. }
            | Self::Commit { txn }
            | Self::Abort { txn }
            | Self::OpenBlock { txn, .. }
            | Self::EndBlock { txn, .. } => *txn,
        }
    }
}

/// Outcomes reported back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// The transaction exists; carries the pool's tags.
    TxnStarted {
        /// SQL dialect tag.
        dialect: Dialect,
        /// Parameter style tag.
        param_style: ParamStyle,
    },
    /// Rows produced by a statement.
    Rows {
        /// The rows, possibly none.
        rows: Vec<Row>,
    },
    /// A statement that had to produce rows produced none.
    NoRows,
    /// The operation succeeded without a payload.
    Done,
    /// The operation failed.
    Failure {
        /// Description of the failure.
        message: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let frame = RequestFrame {
            id: 7,
            request: Request::ExecSql {
                txn: 1,
                block: None,
                sql: "SELECT 1".into(),
                params: vec![Value::Int(3)],
                expect_rows: true,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["request"]["kind"], "exec_sql");
        assert!(json["request"].get("block").is_none());
        assert_eq!(json["request"]["params"][0]["type"], "int");
    }

    #[test]
    fn test_exec_defaults() {
        let frame: RequestFrame = serde_json::from_str(
            r#"{"id":1,"request":{"kind":"exec_sql","txn":2,"sql":"DELETE FROM t"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame.request,
            Request::ExecSql {
                txn: 2,
                block: None,
                sql: "DELETE FROM t".into(),
                params: Vec::new(),
                expect_rows: false,
            }
        );
        assert_eq!(frame.request.txn(), 2);
    }

    #[test]
    fn test_txn_started_carries_tags() {
        let frame = ResponseFrame {
            id: 1,
            response: Response::TxnStarted {
                dialect: Dialect::ORACLE,
                param_style: ParamStyle::NUMERIC,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("oracle-dialect"));
        assert!(json.contains("numeric"));
        let back: ResponseFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
