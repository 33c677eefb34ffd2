//! Remote search
//!
//! Structured requests become single escaped grep/find invocations over an
//! exec channel. All remote command assembly in the crate shares the
//! quoting primitive in [`shell`].

pub mod engine;
pub mod shell;

pub use engine::{RemoteSearchEngine, SearchKind, SearchMatch, SearchRequest};
pub use shell::{shell_quote, shell_quote_all};
