//! Proxy client.
//!
//! A [`ProxyClient`] multiplexes any number of remote transactions over one
//! transport. Like the local facade, every operation is sent when it is
//! called; the returned future only waits for the answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dbspool::{Dialect, ParamStyle, Row, Statement};
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{ClientCodec, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::framed::{FrameReader, FrameWriter};
use crate::protocol::{Request, RequestFrame, Response, ResponseFrame};

type Waiter = oneshot::Sender<Result<Response>>;

struct Inflight {
    closed: bool,
    waiters: HashMap<u64, Waiter>,
}

struct ClientInner {
    requests: mpsc::UnboundedSender<RequestFrame>,
    inflight: Mutex<Inflight>,
    next_frame: AtomicU64,
    next_txn: AtomicU64,
}

impl ClientInner {
    /// Send `request` now and return a future for its response.
    fn call(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_frame.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut inflight = self.inflight.lock();
            if inflight.closed {
                return future::ready(Err(ProxyError::Closed)).boxed();
            }
            inflight.waiters.insert(id, tx);
        }
        if self.requests.send(RequestFrame { id, request }).is_err() {
            self.inflight.lock().waiters.remove(&id);
            return future::ready(Err(ProxyError::Closed)).boxed();
        }
        async move {
            match rx.await {
                Ok(Ok(Response::Failure { message })) => Err(ProxyError::Remote(message)),
                Ok(result) => result,
                Err(_) => Err(ProxyError::Closed),
            }
        }
        .boxed()
    }

    /// Send `request` without waiting for its response.
    fn notify(&self, request: Request) {
        let id = self.next_frame.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.requests.send(RequestFrame { id, request });
    }

    fn dispatch(&self, frame: ResponseFrame) {
        let waiter = self.inflight.lock().waiters.remove(&frame.id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(frame.response));
            }
            None => tracing::trace!(frame = frame.id, "response with no waiter"),
        }
    }

    fn close(&self) {
        let waiters = {
            let mut inflight = self.inflight.lock();
            inflight.closed = true;
            std::mem::take(&mut inflight.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(ProxyError::Closed));
        }
    }
}

/// Client side of a proxy connection.
///
/// Cloning is cheap; clones share the transport.
#[derive(Clone)]
pub struct ProxyClient {
    inner: Arc<ClientInner>,
}

impl ProxyClient {
    /// Start a client over `transport` with default settings.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(transport, &ProxyConfig::default())
    }

    /// Start a client over `transport`.
    pub fn with_config<T>(transport: T, config: &ProxyConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(transport);
        let reader = FrameReader::new(read, ClientCodec::with_config(config));
        let writer = FrameWriter::new(write, ClientCodec::with_config(config));
        let (requests, outgoing) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            requests,
            inflight: Mutex::new(Inflight {
                closed: false,
                waiters: HashMap::new(),
            }),
            next_frame: AtomicU64::new(0),
            next_txn: AtomicU64::new(0),
        });

        tokio::spawn(write_requests(writer, outgoing));
        tokio::spawn(read_responses(reader, Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Start a remote transaction.
    ///
    /// The transaction exists on the server once the request is sent, even
    /// if the pool has no connection for it yet.
    pub async fn begin(&self) -> Result<RemoteTransaction> {
        let txn = self.inner.next_txn.fetch_add(1, Ordering::Relaxed) + 1;
        match self.inner.call(Request::StartTxn { txn }).await? {
            Response::TxnStarted {
                dialect,
                param_style,
            } => Ok(RemoteTransaction {
                client: Arc::clone(&self.inner),
                id: txn,
                dialect,
                param_style,
                finished: AtomicBool::new(false),
                next_block: AtomicU64::new(0),
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Check if the transport has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.inflight.lock().closed
    }
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inflight = self.inner.inflight.lock();
        f.debug_struct("ProxyClient")
            .field("closed", &inflight.closed)
            .field("inflight", &inflight.waiters.len())
            .finish()
    }
}

async fn write_requests<T>(
    mut writer: FrameWriter<T, ClientCodec>,
    mut outgoing: mpsc::UnboundedReceiver<RequestFrame>,
) where
    T: AsyncWrite + Unpin,
{
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = writer.send(frame).await {
            tracing::debug!(error = %e, "proxy transport closed while sending");
            return;
        }
    }
    // Every handle is gone; let the server see end of stream.
    let _ = writer.close().await;
}

async fn read_responses<T>(
    mut reader: FrameReader<T, ClientCodec>,
    inner: std::sync::Weak<ClientInner>,
) where
    T: AsyncRead + Unpin,
{
    loop {
        let next = reader.next().await;
        let Some(client) = inner.upgrade() else {
            return;
        };
        match next {
            Some(Ok(frame)) => client.dispatch(frame),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "proxy connection failed");
                client.close();
                return;
            }
            None => {
                tracing::debug!("proxy connection closed by server");
                client.close();
                return;
            }
        }
    }
}

/// A transaction held by the proxy server on this client's behalf.
///
/// Dropping an unfinished remote transaction aborts it.
pub struct RemoteTransaction {
    client: Arc<ClientInner>,
    id: u64,
    dialect: Dialect,
    param_style: ParamStyle,
    finished: AtomicBool,
    next_block: AtomicU64,
}

impl RemoteTransaction {
    /// Identifier, unique within the client.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// SQL dialect of the pool behind the proxy.
    #[must_use]
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Parameter style of the pool behind the proxy.
    #[must_use]
    pub fn param_style(&self) -> &ParamStyle {
        &self.param_style
    }

    /// Check if commit or abort was requested.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Execute a statement.
    pub fn exec(&self, stmt: impl Into<Statement>) -> BoxFuture<'static, Result<Vec<Row>>> {
        if self.is_finished() {
            return future::ready(Err(ProxyError::AlreadyFinished)).boxed();
        }
        exec_request(&self.client, self.id, None, stmt.into())
    }

    /// Commit the transaction.
    pub fn commit(&self) -> BoxFuture<'static, Result<()>> {
        self.finish(Request::Commit { txn: self.id })
    }

    /// Abort the transaction.
    pub fn abort(&self) -> BoxFuture<'static, Result<()>> {
        self.finish(Request::Abort { txn: self.id })
    }

    /// Open a command block.
    pub fn command_block(&self) -> BoxFuture<'static, Result<RemoteBlock>> {
        if self.is_finished() {
            return future::ready(Err(ProxyError::AlreadyFinished)).boxed();
        }
        let block = self.next_block.fetch_add(1, Ordering::Relaxed) + 1;
        let reply = self.client.call(Request::OpenBlock {
            txn: self.id,
            block,
        });
        let handle = RemoteBlock {
            client: Arc::clone(&self.client),
            txn: self.id,
            id: block,
            ended: AtomicBool::new(false),
        };
        async move {
            expect_done(reply.await?)?;
            Ok::<_, ProxyError>(handle)
        }
        .boxed()
    }

    fn finish(&self, request: Request) -> BoxFuture<'static, Result<()>> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return future::ready(Err(ProxyError::AlreadyFinished)).boxed();
        }
        let reply = self.client.call(request);
        async move { expect_done(reply.await?) }.boxed()
    }
}

impl Drop for RemoteTransaction {
    fn drop(&mut self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.client.notify(Request::Abort { txn: self.id });
        }
    }
}

impl std::fmt::Debug for RemoteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTransaction")
            .field("id", &self.id)
            .field("dialect", &self.dialect)
            .field("param_style", &self.param_style)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// A command block opened on a [`RemoteTransaction`].
///
/// Dropping a block that was not ended ends it.
pub struct RemoteBlock {
    client: Arc<ClientInner>,
    txn: u64,
    id: u64,
    ended: AtomicBool,
}

impl RemoteBlock {
    /// Block identifier, unique within its transaction.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Execute a statement inside the block.
    pub fn exec(&self, stmt: impl Into<Statement>) -> BoxFuture<'static, Result<Vec<Row>>> {
        if self.ended.load(Ordering::Acquire) {
            return future::ready(Err(ProxyError::AlreadyFinished)).boxed();
        }
        exec_request(&self.client, self.txn, Some(self.id), stmt.into())
    }

    /// End the block.
    pub fn end(&self) -> BoxFuture<'static, Result<()>> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return future::ready(Err(ProxyError::AlreadyFinished)).boxed();
        }
        let reply = self.client.call(Request::EndBlock {
            txn: self.txn,
            block: self.id,
        });
        async move { expect_done(reply.await?) }.boxed()
    }
}

impl Drop for RemoteBlock {
    fn drop(&mut self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            self.client.notify(Request::EndBlock {
                txn: self.txn,
                block: self.id,
            });
        }
    }
}

impl std::fmt::Debug for RemoteBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBlock")
            .field("txn", &self.txn)
            .field("id", &self.id)
            .field("ended", &self.ended.load(Ordering::Acquire))
            .finish()
    }
}

fn exec_request(
    client: &ClientInner,
    txn: u64,
    block: Option<u64>,
    stmt: Statement,
) -> BoxFuture<'static, Result<Vec<Row>>> {
    let no_rows = stmt.no_rows_error().map(str::to_owned);
    let reply = client.call(Request::ExecSql {
        txn,
        block,
        sql: stmt.sql().to_owned(),
        params: stmt.params().to_vec(),
        expect_rows: no_rows.is_some(),
    });
    async move {
        match reply.await? {
            Response::Rows { rows } => Ok(rows),
            Response::NoRows => Err(ProxyError::NoRows(no_rows.unwrap_or_default())),
            other => Err(unexpected(&other)),
        }
    }
    .boxed()
}

fn expect_done(response: Response) -> Result<()> {
    match response {
        Response::Done => Ok(()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> ProxyError {
    ProxyError::Remote(format!("unexpected response: {response:?}"))
}
