//! Value encoding pipeline.
//!
//! Turns raw payloads into typed values and back:
//!
//! - `format`: JSON and YAML codecs over a generic document
//! - `middleware`: the decoder stage contract and built-in stages
//! - `pipeline`: [`ValueEncoding`], the chain runner with recovery
//! - `nest`: re-encoding partial documents under a key path

pub mod format;
mod middleware;
mod nest;
mod pipeline;

pub use middleware::{
    AdditionalEvents, DecodeContext, DecoderMiddleware, DerivedValueFn, DerivedValueMiddleware,
    IdentityMiddleware, MergeMiddleware, PlaceholderMiddleware, PlaceholderResolver,
};
pub use nest::{expand_dotted_keys, nest_document, nest_payload, KeyAlias};
pub use pipeline::{DecodeRequest, Decoded, ValueEncoding};
