//! Gateway server implementation
//!
//! ```text
//! TcpListener ─→ ConnLimiter ─→ TLS handshake (client cert + revocation policy)
//!             ─→ PeerIdentity extension ─→ Router
//!                                          ├─ health path → "Hello World!"
//!                                          └─ everything else → forward_request
//! ```

pub mod conn_limit;
pub mod forward;
mod router;
mod server;

pub use conn_limit::{ConnGuard, ConnLimiter};
pub use forward::{CLIENT_ID_HEADER, ForwardState, ForwardTarget, forward_request};
pub use router::{HEALTH_BODY, create_router};
pub use server::{Gateway, shutdown_signal};
