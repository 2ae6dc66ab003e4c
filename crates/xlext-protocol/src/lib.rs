//! Wire protocol shared by the extension host and sandboxed extension contexts.
//!
//! Defines the request/response/event envelopes exchanged across the isolation
//! boundary, their validation rules, the method and event name tables, and the
//! escaping used when a payload is inlined into a bootstrap document.

mod embedding;
mod envelope;
mod methods;

pub use embedding::serialize_for_inline_embedding;
pub use envelope::{
    is_valid_envelope, parse_envelope, Envelope, EnvelopeBody, EnvelopeDirection,
    EXTENSION_SANDBOX_CHANNEL,
};
pub use methods::{
    HostRpcMethod, SandboxEvent, SandboxRpcMethod, UnknownMethodError, HOST_EVENT_AGENT_EVENT,
};
