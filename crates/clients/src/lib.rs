//! Thin HTTP wrappers for the external collaborators the runtime delegates
//! to: the LLM endpoint, the Tonglu data service, webhook nodes, and the
//! object-store policy signer. Each wrapper owns its connection pool and a
//! per-call deadline.

pub mod llm;
pub mod oss;
pub mod tonglu;
pub mod webhook;

pub use llm::{ChatCompletion, LlmClient};
pub use oss::{PostPolicy, PolicySigner};
pub use tonglu::TongluClient;
pub use webhook::{WebhookCall, WebhookCaller};

use tempo_domain::Error;

pub(crate) fn from_reqwest(service: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{service}: {e}"))
    } else {
        Error::Upstream {
            service: service.to_owned(),
            message: e.to_string(),
        }
    }
}
