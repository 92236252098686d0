//! Proxy server fronting a [`Pool`].
//!
//! Each connection is a session that owns the transactions and command
//! blocks its client started. Requests are applied to the pool in the order
//! their frames arrive; responses are written as operations complete.

use std::collections::HashMap;
use std::future::Future;

use dbspool::{CommandBlock, Pool, PoolError, Row, Statement, Transaction};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::codec::{ProxyConfig, ServerCodec};
use crate::error::{ProxyError, Result};
use crate::framed::{FrameReader, FrameWriter};
use crate::protocol::{Request, RequestFrame, Response, ResponseFrame};

/// Message attached to statements sent with `expect_rows`.
///
/// Never shown to the client; it only selects the `NoRows` response.
const NO_ROWS: &str = "statement produced no rows";

/// Serves proxy connections against one pool.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    pool: Pool,
    config: ProxyConfig,
}

impl ProxyServer {
    /// Create a server for `pool` with default settings.
    pub fn new(pool: Pool) -> Self {
        Self::with_config(pool, ProxyConfig::default())
    }

    /// Create a server for `pool`.
    pub fn with_config(pool: Pool, config: ProxyConfig) -> Self {
        Self { pool, config }
    }

    /// The pool being served.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Accept connections until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "accepted proxy connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    tracing::warn!(%peer, error = %e, "proxy connection failed");
                }
            });
        }
    }

    /// Serve one client until its transport closes.
    ///
    /// Transactions the client left open are aborted when the transport
    /// closes.
    pub async fn serve_connection<T>(&self, transport: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(transport);
        let mut reader = FrameReader::new(read, ServerCodec::with_config(&self.config));
        let writer = FrameWriter::new(write, ServerCodec::with_config(&self.config));

        let (responses, outgoing) = mpsc::unbounded_channel();
        tokio::spawn(write_responses(writer, outgoing));

        let mut session = Session::new(self.pool.clone(), responses);
        let result = loop {
            match reader.next().await {
                Some(Ok(frame)) => session.handle(frame),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        session.close();
        result
    }
}

async fn write_responses<T>(
    mut writer: FrameWriter<T, ServerCodec>,
    mut outgoing: mpsc::UnboundedReceiver<ResponseFrame>,
) where
    T: AsyncWrite + Unpin,
{
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = writer.send(frame).await {
            tracing::debug!(error = %e, "dropping proxy responses, transport closed");
            return;
        }
    }
    let _ = writer.close().await;
}

/// Transactions and blocks started by one client.
struct Session {
    pool: Pool,
    responses: mpsc::UnboundedSender<ResponseFrame>,
    transactions: HashMap<u64, Transaction>,
    blocks: HashMap<(u64, u64), CommandBlock>,
}

impl Session {
    fn new(pool: Pool, responses: mpsc::UnboundedSender<ResponseFrame>) -> Self {
        Self {
            pool,
            responses,
            transactions: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    fn handle(&mut self, frame: RequestFrame) {
        let RequestFrame { id, request } = frame;
        tracing::trace!(frame = id, txn = request.txn(), ?request, "proxy request");

        match request {
            Request::StartTxn { txn } => {
                let transaction = self.pool.acquire();
                let response = Response::TxnStarted {
                    dialect: transaction.dialect().clone(),
                    param_style: transaction.param_style().clone(),
                };
                if let Some(previous) = self.transactions.insert(txn, transaction) {
                    tracing::warn!(txn, "client reused a transaction id, aborting the previous one");
                    drop(previous);
                }
                self.reply(id, response);
            }
            Request::ExecSql {
                txn,
                block,
                sql,
                params,
                expect_rows,
            } => {
                let mut stmt = Statement::new(sql).with_params(params);
                if expect_rows {
                    stmt = stmt.raise_on_zero_rows(NO_ROWS);
                }
                let pending = match block {
                    None => self.transaction(txn).map(|t| t.exec(stmt)),
                    Some(block) => self.block(txn, block).map(|b| b.exec(stmt)),
                };
                match pending {
                    Ok(pending) => self.reply_later(id, pending, rows_response),
                    Err(e) => self.reply(id, failure(&e)),
                }
            }
            Request::Commit { txn } => match self.transactions.remove(&txn) {
                Some(transaction) => self.reply_later(id, transaction.commit(), done_response),
                None => self.reply(id, failure(&ProxyError::UnknownTransaction(txn))),
            },
            Request::Abort { txn } => match self.transactions.remove(&txn) {
                Some(transaction) => {
                    let pending = transaction.abort();
                    self.blocks.retain(|(owner, _), _| *owner != txn);
                    self.reply_later(id, pending, done_response);
                }
                None => self.reply(id, failure(&ProxyError::UnknownTransaction(txn))),
            },
            Request::OpenBlock { txn, block } => {
                let response = match self.transactions.get(&txn) {
                    Some(transaction) => match transaction.command_block() {
                        Ok(command_block) => {
                            self.blocks.insert((txn, block), command_block);
                            Response::Done
                        }
                        Err(e) => failure(&e),
                    },
                    None => failure(&ProxyError::UnknownTransaction(txn)),
                };
                self.reply(id, response);
            }
            Request::EndBlock { txn, block } => {
                let response = match self.blocks.remove(&(txn, block)) {
                    Some(command_block) => match command_block.end() {
                        Ok(()) => Response::Done,
                        Err(e) => failure(&e),
                    },
                    None => failure(&ProxyError::UnknownBlock { txn, block }),
                };
                self.reply(id, response);
            }
        }
    }

    fn transaction(&self, txn: u64) -> Result<&Transaction> {
        self.transactions
            .get(&txn)
            .ok_or(ProxyError::UnknownTransaction(txn))
    }

    fn block(&self, txn: u64, block: u64) -> Result<&CommandBlock> {
        self.blocks
            .get(&(txn, block))
            .ok_or(ProxyError::UnknownBlock { txn, block })
    }

    fn reply(&self, id: u64, response: Response) {
        let _ = self.responses.send(ResponseFrame { id, response });
    }

    /// Answer once `pending` resolves.
    fn reply_later<T, F>(&self, id: u64, pending: F, convert: fn(T) -> Response)
    where
        F: Future<Output = dbspool::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let responses = self.responses.clone();
        tokio::spawn(async move {
            let response = match pending.await {
                Ok(value) => convert(value),
                Err(e) => failure(&e),
            };
            let _ = responses.send(ResponseFrame { id, response });
        });
    }

    /// Abort whatever the client left behind.
    fn close(&mut self) {
        if !self.transactions.is_empty() {
            tracing::debug!(
                open = self.transactions.len(),
                "proxy client went away, aborting its transactions"
            );
        }
        for (_, transaction) in self.transactions.drain() {
            drop(transaction.abort());
        }
        self.blocks.clear();
    }
}

fn rows_response(rows: Vec<Row>) -> Response {
    Response::Rows { rows }
}

fn done_response(_: ()) -> Response {
    Response::Done
}

/// Translate a local error for the wire.
fn failure(err: &(dyn std::error::Error + 'static)) -> Response {
    if let Some(PoolError::NoRows(_)) = err.downcast_ref::<PoolError>() {
        return Response::NoRows;
    }
    Response::Failure {
        message: err.to_string(),
    }
}
