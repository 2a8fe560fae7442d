//! FleetGate package-signing primitives.
//!
//! Update packages are signed offline with an Ed25519 key; the gateway and
//! every agent verify the detached signature against the fleet's trusted
//! public key before a package is stored or installed.

pub mod error;
pub mod signing;

pub use error::CryptoError;
pub use signing::{PackageVerifier, SigningKeyPair, fingerprint_of};
