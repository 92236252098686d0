//! # dbspool-proxy
//!
//! Network access to a [`dbspool::Pool`] from another process.
//!
//! A [`ProxyServer`] fronts a pool; a [`ProxyClient`] talks to it over any
//! byte stream and hands out [`RemoteTransaction`]s that behave like local
//! transactions: operations keep their call order, command blocks group
//! statements, and the pool's dialect and parameter style come back with
//! every new transaction, including one still waiting for a connection.
//!
//! ## Wire format
//!
//! ```text
//! Client ──RequestFrame──► FrameCodec ──► Session ──► Pool
//!        ◄─ResponseFrame── FrameCodec ◄── (as operations complete)
//! ```
//!
//! Frames are a 4-byte big-endian length followed by a JSON body. Errors
//! cross the wire as messages only; the client reports them as
//! [`ProxyError::Remote`], except for the zero-row case, which becomes the
//! error message the caller attached to its statement.
//!
//! ```rust,ignore
//! use dbspool_proxy::{ProxyClient, ProxyServer};
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:7878").await?;
//! tokio::spawn(async move { ProxyServer::new(pool).serve(listener).await });
//!
//! let client = ProxyClient::new(tokio::net::TcpStream::connect("127.0.0.1:7878").await?);
//! let txn = client.begin().await?;
//! txn.exec("UPDATE calendar SET name = 'home'").await?;
//! txn.commit().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod codec;
pub mod error;
pub mod framed;
pub mod protocol;
pub mod server;

pub use client::{ProxyClient, RemoteBlock, RemoteTransaction};
pub use codec::{ClientCodec, FrameCodec, ProxyConfig, ServerCodec};
pub use error::{ProxyError, Result};
pub use framed::{FrameReader, FrameWriter};
pub use protocol::{Request, RequestFrame, Response, ResponseFrame};
pub use server::ProxyServer;
