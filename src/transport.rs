//! The TLS transport shared by agents and the host: PEM loading, the
//! concatenated-JSON codec, the client-side dialer, and the server-side
//! acceptor.
//!
//! Trust works the same in both directions and is deliberately not
//! CA-based: the host requires a client certificate but does not verify its
//! chain (identity is bound by fingerprint at registration), and the agent
//! does not verify the server's name or chain (it talks to exactly the host
//! it was configured with).

pub mod client;
pub mod codec;
pub mod pem;
pub mod server;
