//! HTTP listeners and their lifecycle.
//!
//! Two listeners run side by side:
//! - **Redirect** (plaintext): answers HTTP-01 challenges, redirects everything else to HTTPS
//! - **TLS**: terminates TLS with on-demand certificates and proxies to the backend
//!
//! The server module coordinates startup, the drain on shutdown and SIGHUP reloads.

pub mod proxy;
pub mod redirect;
mod server;
mod shutdown;

pub use proxy::ProxyState;
pub use redirect::RedirectState;
pub use server::{start_server, Gateway, Lifecycle, Listeners, Phase, ServerError};
pub use shutdown::termination_signal;
