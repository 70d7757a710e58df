//! # callbridge
//!
//! Typed remote-call bridge. Functions are declared once with
//! [`function!`] and called through a [`Bridge`]; each call returns a
//! [`Call`] future that resolves exactly once. A function marked `local`
//! runs in this process, a `remote` one runs on the peer over a single
//! multiplexed connection. Both paths share the codec and the failure
//! shapes, so a function can move sides without its callers noticing.
//! Functions declared with [`stream_function!`] yield a [`CallStream`]
//! of items instead.
//!
//! ## Architecture
//!
//! - **Dispatcher** ([`Bridge`]): encodes arguments, allocates correlation
//!   ids, routes local or remote
//! - **Connection** ([`connection`]): one duplex stream, queue while down,
//!   reconnect with backoff
//! - **Correlation** ([`correlation`]): call id -> pending completion
//! - **Codec** ([`codec`]) and **records** ([`record`]): schema-driven
//!   MessagePack
//! - **Server** ([`Server`]): executes calls arriving over connections
//!
//! ## Example
//!
//! ```no_run
//! use callbridge::{record, Bridge, Server};
//!
//! record! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct Person {
//!         pub rowid: Option<i64>,
//!         pub name: Option<String>,
//!     }
//! }
//!
//! callbridge::function! {
//!     pub remote fn insert_person(person: Person) -> i64 as InsertPerson;
//! }
//!
//! #[tokio::main]
//! async fn main() -> callbridge::Result<()> {
//!     let server = Server::builder()
//!         .function::<InsertPerson, _, _, std::convert::Infallible>(|(_person,)| async move { Ok(1) })
//!         .build()?
//!         .bind("127.0.0.1:0")
//!         .await?;
//!
//!     let bridge = Bridge::builder()
//!         .function::<InsertPerson>()
//!         .endpoint(&server.url())
//!         .build()?;
//!     bridge.connect().await?;
//!
//!     let person = Person { rowid: None, name: Some("Bob".to_string()) };
//!     let rowid = InsertPerson::call(&bridge, person).await?;
//!     assert_eq!(rowid, 1);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod function;
pub mod handler;
pub mod local;
pub mod protocol;
pub mod record;
pub mod server;
pub mod transport;
pub mod writer;

mod global;

pub use config::{BridgeConfig, QueueConfig, ReconnectPolicy};
pub use connection::ConnectionState;
pub use dispatcher::{Bridge, BridgeBuilder, Call, CallStream};
pub use error::{BridgeError, ErrorDescriptor, ErrorKind, Result};
pub use function::{Function, Locality, StreamFunction};
pub use global::{bridge, init, install};
pub use server::{RunningServer, Server, ServerBuilder};
