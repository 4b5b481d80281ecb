//! Per-call settings.

use std::time::Duration;

use connectrpc_duplex_core::Metadata;

use crate::context::CallContext;
use crate::error::StreamError;

/// Settings for one call: its time budget, the context it runs under and
/// the application metadata sent with the request head.
///
/// ```ignore
/// use connectrpc_duplex::{CallContext, CallOptions};
/// use std::time::Duration;
///
/// let ctx = CallContext::new();
/// let options = CallOptions::new()
///     .timeout(Duration::from_secs(5))
///     .context(ctx.clone())
///     .header("authorization", "Bearer token123")?;
///
/// let stream = client
///     .call_bidi_stream_with_options::<Req, Res>("my.service/Method", options)?;
/// // Later, from anywhere:
/// ctx.cancel();
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    timeout: Option<Duration>,
    context: Option<CallContext>,
    metadata: Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the call by `timeout`, replacing the client's default.
    ///
    /// The remaining time is announced to the server in the protocol's
    /// timeout header when the request head is written.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the call under `context`. Cancelling it cancels the stream, and
    /// its own deadline still applies when a timeout is also set.
    pub fn context(mut self, context: CallContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Append an ASCII metadata entry to the request head.
    pub fn header(mut self, key: &str, value: &str) -> Result<Self, StreamError> {
        self.metadata.append(key, value)?;
        Ok(self)
    }

    /// Set a binary metadata entry; `key` must end in `-bin`.
    pub fn binary_header(mut self, key: &str, value: &[u8]) -> Result<Self, StreamError> {
        self.metadata.insert_bin(key, value)?;
        Ok(self)
    }

    /// Replace all request metadata.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn request_metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Resolve into the context the stream runs under and the metadata to
    /// merge into the request head. Protocol-owned keys (`content-type`,
    /// `grpc-*`, `connect-*` and the like) are dropped.
    pub(crate) fn into_call(self, default_timeout: Option<Duration>) -> (CallContext, Metadata) {
        let mut ctx = self.context.unwrap_or_default();
        if let Some(timeout) = self.timeout.or(default_timeout) {
            ctx = ctx.with_timeout(timeout);
        }
        (ctx, self.metadata.without_reserved())
    }
}
