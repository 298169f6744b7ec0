//! Peer mesh connecting cluster members.
//!
//! The mesh maps member ids and addresses to bidirectional connections over a
//! pluggable [`Transport`]. Every connection starts with a [`Hello`]
//! handshake exchanging id, advertised address and version; afterwards either
//! side can issue typed [`Message`] requests and await the correlated reply.
//!
//! Members running versions with a different major/minor release put the
//! mesh into a read-only state which callers observe through
//! [`Mesh::is_read_only`] and [`Mesh::subscribe_read_only`].
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frame;
mod memory;
mod mesh;
mod message;
mod peer;
mod tcp;
mod transport;

pub use error::{MeshError, MeshResult};
pub use frame::Hello;
pub use memory::{MemoryHub, MemoryTransport};
pub use mesh::{Mesh, MeshConfig, MeshEvent, versions_compatible};
pub use message::{CONTENT_TYPE_MESH_ERROR, ContentType, HeaderKey, Message};
pub use peer::Peer;
pub use tcp::{TcpOptions, TcpTransport};
pub use transport::{Connection, Listener, Transport};
