//! FreeSWITCH Event Socket Layer (ESL) client and server for Rust
//!
//! This crate speaks both sides of ESL, FreeSWITCH's line-oriented control
//! protocol, over raw TCP or WebSocket:
//!
//! - **Inbound**: dial the softswitch, authenticate with a password, then
//!   issue commands and receive events.
//! - **Outbound**: listen for the connections FreeSWITCH opens on behalf
//!   of a call (`<action application="socket" .../>`) and hand each session
//!   to a handler.
//!
//! # Architecture
//!
//! Each [`Connection`] runs a receive loop that demultiplexes incoming
//! records by `Content-Type` into per-kind sinks, and an event loop that
//! decodes `text/event-plain`/`-xml`/`-json` envelopes and fans them out
//! to listeners registered under channel/application/job UUIDs (or the
//! [`EVENT_LISTEN_ALL`] wildcard). Commands are serialized: ESL carries no
//! correlation ids, so one command is outstanding at a time and replies
//! are matched by order.
//!
//! # Inbound
//!
//! ```rust,no_run
//! use esl_duplex::{dial, EventFormat, Events, EVENT_LISTEN_ALL};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), esl_duplex::EslError> {
//!     let conn = dial("127.0.0.1:8021", "ClueCon", || println!("disconnected")).await?;
//!
//!     conn.register_event_listener(EVENT_LISTEN_ALL, |event| {
//!         println!("event: {:?}", event.name());
//!     });
//!     conn.send_command(&Events::new(EventFormat::Plain, ["CHANNEL_ANSWER"]))
//!         .await?;
//!
//!     let status = conn.api("status").await?;
//!     println!("{}", status.body_str().unwrap_or(""));
//!
//!     conn.exit_and_close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Outbound
//!
//! Point FreeSWITCH at your listener:
//!
//! ```xml
//! <action application="socket" data="127.0.0.1:8040 async full"/>
//! ```
//!
//! ```rust,no_run
//! use esl_duplex::{listen_and_serve, Execute};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), esl_duplex::EslError> {
//!     listen_and_serve("127.0.0.1:8040", |conn, connect_reply| async move {
//!         println!(
//!             "call {}",
//!             connect_reply.header("Unique-ID").unwrap_or_default()
//!         );
//!         let _ = conn.send_command(&Execute::answer()).await;
//!         let _ = conn
//!             .send_command(&Execute::playback("ivr/ivr-welcome.wav"))
//!             .await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! The WebSocket flavor of either mode is selected through
//! [`Protocol::Websocket`] on [`InboundOptions`] / [`OutboundOptions`];
//! the framing is otherwise identical, one record per text frame.
//!
//! # Logging
//!
//! Diagnostics go through [`tracing`]; install a subscriber to see them,
//! or none for silence.

pub mod command;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod inbound;
pub mod outbound;
pub mod response;
pub mod transport;

pub use command::{
    Api, Auth, Command, Connect, Events, Execute, Exit, Filter, Linger, LingerDirective, MyEvents,
    Originate, SendEvent, SendMsg,
};
pub use connection::{Connection, EventListener, Options};
pub use constants::{DEFAULT_ESL_PORT, EVENT_LISTEN_ALL, HEADER_REQUEST_ID};
pub use error::{EslError, EslResult};
pub use event::{Event, EventFormat, EventName, ParseEventFormatError, ParseEventNameError};
pub use inbound::{dial, InboundOptions, OnDisconnect};
pub use outbound::{listen_and_serve, OutboundHandler, OutboundOptions};
pub use response::{Headers, RawResponse};
pub use transport::{Network, Protocol};
