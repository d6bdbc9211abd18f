//! Root authority, leaf issuance and TLS termination

pub mod authority;
pub mod cache;
pub mod config;
pub mod server;
pub mod store;

pub use authority::{CertificateAuthority, LeafCertificate, LeafIssuer};
pub use store::{FileRootStore, RootStore};
pub use server::TlsTerminator;
