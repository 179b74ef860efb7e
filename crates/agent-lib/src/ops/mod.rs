//! Client for the Ops HTTP/JSON API
//!
//! All components talk to Ops through this client: cookie-based login,
//! the `{response, alerts}` envelope, and the typed endpoints each
//! component needs. A session object is cheap to clone and safe to share
//! across tasks; the cookie jar is written only by the login path.

mod client;

pub use client::{CreateOutcome, Envelope, OpsClient, OpsConfig};
