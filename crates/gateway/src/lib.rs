//! The TempoOS HTTP gateway: the SSE chat controller, the workflow and
//! registry APIs, the upload-signature endpoint, and the background services
//! (tempo clock, artifact capture listener).

pub mod api;
pub mod bootstrap;
pub mod capture;
pub mod runtime;
pub mod state;

pub use state::AppState;
