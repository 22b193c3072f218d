//! TLS termination
//!
//! Certificates live in a process-wide [`CertStore`] keyed by lower-case
//! host name. The rustls handshake asks [`SniResolver`] for the certificate
//! matching the client's SNI; a miss aborts the handshake.

pub mod cert_store;

pub use cert_store::{
    parse_leaf, san_file_stem, server_config, CertError, CertStore, LeafInfo, SniResolver,
};
