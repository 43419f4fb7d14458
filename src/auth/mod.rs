//! Credential acquisition: session negotiation against the platform's login
//! surface and the memoizing token source the transport draws from.

mod session;
mod token;

pub use session::{NegotiatedSession, SessionNegotiator};
pub use token::{BearerToken, TokenSource};
