//! Discovery, wire protocol and transfer engine for the easyshare tools.
//!
//! # Overview
//!
//! Easyshare is a two-program system: `esd` exposes named sharings on a
//! host, `es` discovers servers on the LAN and moves files both ways.
//!
//! ```text
//! es (client)                           esd (server)
//!   |  ~~~~ UDP broadcast probe ~~~~~~~~> |  discovery daemon
//!   |  <~~~ unicast JSON descriptor ~~~~ |
//!   |                                     |
//!   |  ---- TCP control channel --------> |  one session per connection
//!   |       auth / open / rls / ...       |
//!   |  ---- get / put ------------------> |  ephemeral transfer endpoint
//!   |  ==== dedicated TCP stream ======== |  manifest + files + summary
//!   ```
//!
//! # Key components
//!
//! - [`protocol`] - every JSON type that crosses the wire: requests,
//!   responses, descriptors, manifests, transfer frames.
//! - [`streams`] - 4-byte big-endian length framing over TCP or TLS.
//! - [`tls`] - certificate loading/generation and fingerprint pinning.
//! - [`discovery`] - the broadcast probe daemon and scanner.
//! - [`transfer`] - the GET/PUT engine and endpoint plumbing.

pub mod discovery;
pub mod protocol;
pub mod streams;
pub mod tls;
pub mod transfer;
