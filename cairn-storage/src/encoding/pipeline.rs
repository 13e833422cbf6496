//! Typed value encoding over an ordered middleware chain.
//!
//! ```text
//! bytes ─▶ parse ─▶ stage 0 ─▶ stage 1 ─▶ … ─▶ bind T
//!            │         │          │             │
//!            └─────────┴── failure ┴─────────────┘
//!                          ▼
//!              earliest recoverable stage at or before the failure
//!              rebuilds from the raw payload, then bind T
//! ```

use super::format;
use super::middleware::{
    AdditionalEvents, DecodeContext, DecoderMiddleware, IdentityMiddleware, MergeMiddleware,
    PlaceholderMiddleware,
};
use cairn_core::{
    DecodeError, Document, EventType, Format, Identifier, StoreConfig, StoreError, StoreResult,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

/// A record on its way through [`ValueEncoding::decode`].
#[derive(Debug, Clone, Copy)]
pub struct DecodeRequest<'a> {
    pub event_type: &'a EventType,
    pub identifier: &'a Identifier,
    pub payload: &'a [u8],
    pub format: Format,
}

/// Result of a successful decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    /// The bound value, or `None` when the record is a delete.
    pub value: Option<T>,
    /// Name of the stage that recovered the record, if one had to.
    pub recovered_by: Option<String>,
}

/// Serializes and deserializes values of type `T`.
pub struct ValueEncoding<T> {
    default_format: Format,
    chain: Vec<Arc<dyn DecoderMiddleware>>,
    additional: AdditionalEvents,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ValueEncoding<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Encoding with no middleware: records replace rather than merge.
    pub fn new(default_format: Format) -> Self {
        Self {
            default_format,
            chain: Vec::new(),
            additional: AdditionalEvents::new(),
            _marker: PhantomData,
        }
    }

    /// The usual chain: placeholders, identity check, merge-on-read.
    pub fn standard(config: &StoreConfig) -> Self {
        let mut encoding = Self::new(config.default_format);
        if config.substitute_placeholders {
            encoding = encoding.with_middleware(PlaceholderMiddleware::from_env());
        }
        if let Some(field) = &config.identity_field {
            encoding = encoding.with_middleware(IdentityMiddleware::new(field.clone()));
        }
        encoding.with_middleware(MergeMiddleware)
    }

    /// Append a stage to the chain.
    pub fn with_middleware(mut self, stage: impl DecoderMiddleware + 'static) -> Self {
        self.chain.push(Arc::new(stage));
        self
    }

    pub fn default_format(&self) -> Format {
        self.default_format
    }

    /// Names of the stages, in order.
    pub fn stages(&self) -> Vec<&str> {
        self.chain.iter().map(|s| s.name()).collect()
    }

    /// Queue stages push derived records to; shared with the owning engine.
    pub fn additional_events(&self) -> AdditionalEvents {
        self.additional.clone()
    }

    pub fn is_null(&self, bytes: &[u8], format: Format) -> bool {
        format::is_null(format, bytes)
    }

    pub fn is_empty(&self, bytes: &[u8], format: Format) -> bool {
        format::is_empty(format, bytes)
    }

    /// Serialize a value in the default format.
    pub fn serialize(&self, value: &T) -> StoreResult<Vec<u8>> {
        self.render(&self.to_document(value)?)
    }

    /// Render a document in the default format.
    pub fn render(&self, doc: &Document) -> StoreResult<Vec<u8>> {
        Ok(format::render(self.default_format, doc)?)
    }

    pub fn to_document(&self, value: &T) -> StoreResult<Document> {
        serde_json::to_value(value).map_err(|e| {
            DecodeError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Decode a standalone record, without a cached predecessor.
    pub fn deserialize(&self, request: DecodeRequest<'_>) -> StoreResult<Option<T>> {
        Ok(self.decode(request, None)?.value)
    }

    /// Decode a record merged onto its cached predecessor.
    pub fn decode(&self, request: DecodeRequest<'_>, prior: Option<&T>) -> StoreResult<Decoded<T>> {
        self.run(request, prior, false)
    }

    /// Decode without side effects, to check what applying would produce.
    pub fn preview(&self, request: DecodeRequest<'_>, prior: Option<&T>) -> StoreResult<Decoded<T>> {
        self.run(request, prior, true)
    }

    fn run(
        &self,
        request: DecodeRequest<'_>,
        prior: Option<&T>,
        preview: bool,
    ) -> StoreResult<Decoded<T>> {
        if format::is_null(request.format, request.payload) {
            return Ok(Decoded {
                value: None,
                recovered_by: None,
            });
        }

        let prior_doc = prior.map(|p| self.to_document(p)).transpose()?;
        let ctx = DecodeContext {
            event_type: request.event_type,
            identifier: request.identifier,
            format: request.format,
            payload: request.payload,
            prior: prior_doc.as_ref(),
            preview,
        };

        let parsed = format::parse(request.format, request.identifier, request.payload);
        let mut doc = match parsed {
            Ok(doc) => doc,
            Err(e) => return self.recover(&ctx, self.chain.len(), e.into()),
        };

        for (index, stage) in self.chain.iter().enumerate() {
            doc = match stage.apply(&ctx, doc) {
                Ok(next) => next,
                Err(e) if e.is_dropped_record() => return Err(e),
                Err(e) => return self.recover(&ctx, index, e),
            };
        }

        if doc.is_null() {
            return Ok(Decoded {
                value: None,
                recovered_by: None,
            });
        }
        match bind::<T>(request.identifier, doc) {
            Ok(value) => Ok(Decoded {
                value: Some(value),
                recovered_by: None,
            }),
            Err(e) => self.recover(&ctx, self.chain.len(), e),
        }
    }

    /// Ask the earliest recoverable stage at or before `failed_at` to
    /// rebuild the record. Parse and binding failures pass the chain length,
    /// so every stage is eligible.
    fn recover(
        &self,
        ctx: &DecodeContext<'_>,
        failed_at: usize,
        error: StoreError,
    ) -> StoreResult<Decoded<T>> {
        let Some(stage) = self
            .chain
            .iter()
            .take(failed_at + 1)
            .find(|stage| stage.can_recover())
        else {
            return Err(error);
        };
        let doc = stage.recover(ctx).map_err(|_| error)?;
        if doc.is_null() {
            return Ok(Decoded {
                value: None,
                recovered_by: Some(stage.name().to_string()),
            });
        }
        Ok(Decoded {
            value: Some(bind::<T>(ctx.identifier, doc)?),
            recovered_by: Some(stage.name().to_string()),
        })
    }
}

fn bind<T: DeserializeOwned>(identifier: &Identifier, doc: Value) -> StoreResult<T> {
    serde_json::from_value(doc).map_err(|e| {
        DecodeError::Binding {
            identifier: identifier.clone(),
            reason: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Provider {
        url: String,
        #[serde(default)]
        timeout: u32,
    }

    /// Recovers by reading a legacy `endpoint` field as `url`.
    struct LegacyEndpoint;

    impl DecoderMiddleware for LegacyEndpoint {
        fn name(&self) -> &str {
            "legacy-endpoint"
        }

        fn apply(&self, _ctx: &DecodeContext<'_>, doc: Document) -> StoreResult<Document> {
            Ok(doc)
        }

        fn can_recover(&self) -> bool {
            true
        }

        fn recover(&self, ctx: &DecodeContext<'_>) -> StoreResult<Document> {
            let doc = format::parse(ctx.format, ctx.identifier, ctx.payload)?;
            Ok(json!({"url": doc.get("endpoint").cloned().unwrap_or(Value::Null)}))
        }
    }

    /// Fails every record.
    struct Reject;

    impl DecoderMiddleware for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        fn apply(&self, ctx: &DecodeContext<'_>, _doc: Document) -> StoreResult<Document> {
            Err(DecodeError::Middleware {
                stage: "reject".to_string(),
                identifier: ctx.identifier.clone(),
                reason: "rejected".to_string(),
            }
            .into())
        }
    }

    fn decode(encoding: &ValueEncoding<Provider>, payload: &[u8], prior: Option<&Provider>) -> StoreResult<Decoded<Provider>> {
        let event_type = EventType::entities();
        let identifier = Identifier::new(["providers"], "svc1");
        encoding.decode(
            DecodeRequest {
                event_type: &event_type,
                identifier: &identifier,
                payload,
                format: Format::Yaml,
            },
            prior,
        )
    }

    fn merging() -> ValueEncoding<Provider> {
        ValueEncoding::new(Format::Yaml).with_middleware(MergeMiddleware)
    }

    #[test]
    fn test_merge_on_read_keeps_unmentioned_fields() {
        let prior = Provider {
            url: "http://a".to_string(),
            timeout: 5,
        };
        let decoded = decode(&merging(), b"timeout: 10", Some(&prior)).expect("decode");
        assert_eq!(
            decoded.value,
            Some(Provider {
                url: "http://a".to_string(),
                timeout: 10
            })
        );
        assert_eq!(decoded.recovered_by, None);
    }

    #[test]
    fn test_null_payload_is_delete() {
        let prior = Provider {
            url: "http://a".to_string(),
            timeout: 5,
        };
        let decoded = decode(&merging(), b"~", Some(&prior)).expect("decode");
        assert_eq!(decoded.value, None);
    }

    #[test]
    fn test_binding_failure_without_recovery_fails() {
        let err = decode(&merging(), b"timeout: 10", None).unwrap_err();
        assert!(matches!(err, StoreError::Decode(DecodeError::Binding { .. })));
    }

    #[test]
    fn test_binding_failure_recovered_by_earlier_stage() {
        let encoding = merging().with_middleware(LegacyEndpoint);
        let decoded = decode(&encoding, b"endpoint: http://legacy", None).expect("decode");
        assert_eq!(decoded.value.map(|p| p.url), Some("http://legacy".to_string()));
        assert_eq!(decoded.recovered_by.as_deref(), Some("legacy-endpoint"));
    }

    #[test]
    fn test_recovery_only_from_stages_at_or_before_failure() {
        let rejected_first = ValueEncoding::<Provider>::new(Format::Yaml)
            .with_middleware(Reject)
            .with_middleware(LegacyEndpoint);
        assert!(decode(&rejected_first, b"endpoint: http://x", None).is_err());

        let recoverable_first = ValueEncoding::<Provider>::new(Format::Yaml)
            .with_middleware(LegacyEndpoint)
            .with_middleware(Reject);
        let decoded = decode(&recoverable_first, b"endpoint: http://x", None).expect("decode");
        assert_eq!(decoded.value.map(|p| p.url), Some("http://x".to_string()));
    }

    #[test]
    fn test_parse_failure_recoverable_by_any_stage() {
        struct Fallback;
        impl DecoderMiddleware for Fallback {
            fn name(&self) -> &str {
                "fallback"
            }
            fn apply(&self, _ctx: &DecodeContext<'_>, doc: Document) -> StoreResult<Document> {
                Ok(doc)
            }
            fn can_recover(&self) -> bool {
                true
            }
            fn recover(&self, _ctx: &DecodeContext<'_>) -> StoreResult<Document> {
                Ok(json!({"url": "http://fallback"}))
            }
        }

        let encoding = merging().with_middleware(Fallback);
        let decoded = decode(&encoding, b"url: [unclosed", None).expect("decode");
        assert_eq!(decoded.recovered_by.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_standard_chain_order() {
        let config = StoreConfig::default();
        let encoding = ValueEncoding::<Provider>::standard(&config);
        assert_eq!(encoding.stages(), vec!["placeholder", "identity", "merge"]);
    }

    #[test]
    fn test_serialize_uses_default_format() {
        let encoding = ValueEncoding::<Provider>::new(Format::Json);
        let bytes = encoding
            .serialize(&Provider {
                url: "http://a".to_string(),
                timeout: 1,
            })
            .expect("serialize");
        assert_eq!(bytes, br#"{"timeout":1,"url":"http://a"}"#.to_vec());
    }
}
