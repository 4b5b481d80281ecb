//! Typed client streams.

use std::marker::PhantomData;

use connectrpc_duplex_core::{MessageCodec, Metadata, ProtoCodec, Status};
use futures::Stream;

use crate::conn::ClientConn;
use crate::duplex::DuplexStream;
use crate::error::StreamError;

/// Result of a unary or client-streaming call.
#[derive(Debug, Clone)]
pub struct Response<T> {
    message: T,
    headers: Metadata,
    trailers: Metadata,
}

impl<T> Response<T> {
    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_inner(self) -> T {
        self.message
    }

    /// Response headers sent by the server.
    pub fn headers(&self) -> &Metadata {
        &self.headers
    }

    /// Trailers sent by the server.
    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }
}

/// Bidirectional stream: send and receive independently.
///
/// `send` and `receive` take `&self`, so one task can send while another
/// receives through a clone of the stream.
pub struct BidiStream<Req, Res, C = ProtoCodec> {
    stream: DuplexStream<ClientConn>,
    codec: C,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res, C: Clone> Clone for BidiStream<Req, Res, C> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            codec: self.codec.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Req, Res, C> BidiStream<Req, Res, C>
where
    C: MessageCodec<Req> + MessageCodec<Res>,
{
    pub(crate) fn new(stream: DuplexStream<ClientConn>, codec: C) -> Self {
        Self {
            stream,
            codec,
            _marker: PhantomData,
        }
    }

    pub async fn send(&self, message: &Req) -> Result<(), StreamError> {
        let data = MessageCodec::<Req>::marshal(&self.codec, message)?;
        self.stream.send(data).await
    }

    /// Finish sending; responses keep arriving.
    pub fn close_send(&self) {
        self.stream.close_send();
    }

    /// Next response, or `Ok(None)` once the server finished cleanly.
    pub async fn receive(&self) -> Result<Option<Res>, StreamError> {
        receive_message(&self.stream, &self.codec).await
    }

    pub async fn response_headers(&self) -> Result<Metadata, StreamError> {
        self.stream.peer_headers().await
    }

    /// Available once `receive` returned its terminal result.
    pub fn trailers(&self) -> Option<&Metadata> {
        self.stream.trailers()
    }

    pub async fn close(&self) -> Result<(), StreamError> {
        self.stream.close().await
    }

    pub fn cancel(&self) -> StreamError {
        self.stream.cancel()
    }

    pub fn inner(&self) -> &DuplexStream<ClientConn> {
        &self.stream
    }
}

/// Responses of a server-streaming call.
pub struct ServerStream<Res, C = ProtoCodec> {
    stream: DuplexStream<ClientConn>,
    codec: C,
    _marker: PhantomData<fn() -> Res>,
}

impl<Res, C: Clone> Clone for ServerStream<Res, C> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            codec: self.codec.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Res, C> ServerStream<Res, C>
where
    C: MessageCodec<Res>,
{
    pub(crate) fn new(stream: DuplexStream<ClientConn>, codec: C) -> Self {
        Self {
            stream,
            codec,
            _marker: PhantomData,
        }
    }

    pub async fn receive(&self) -> Result<Option<Res>, StreamError> {
        receive_message(&self.stream, &self.codec).await
    }

    pub async fn response_headers(&self) -> Result<Metadata, StreamError> {
        self.stream.peer_headers().await
    }

    pub fn trailers(&self) -> Option<&Metadata> {
        self.stream.trailers()
    }

    pub async fn close(&self) -> Result<(), StreamError> {
        self.stream.close().await
    }

    pub fn cancel(&self) -> StreamError {
        self.stream.cancel()
    }

    pub fn inner(&self) -> &DuplexStream<ClientConn> {
        &self.stream
    }

    /// Adapt into a [`Stream`] of responses. The stream ends after the
    /// terminal result; an error is yielded as the last item.
    pub fn into_stream(self) -> impl Stream<Item = Result<Res, StreamError>> + Send
    where
        Res: Send,
    {
        futures::stream::unfold(Some(self), |state| async move {
            let stream = state?;
            match stream.receive().await {
                Ok(Some(message)) => Some((Ok(message), Some(stream))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

/// Client-streaming call: send many requests, receive one response.
pub struct ClientStream<Req, Res, C = ProtoCodec> {
    stream: DuplexStream<ClientConn>,
    codec: C,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res, C> ClientStream<Req, Res, C>
where
    C: MessageCodec<Req> + MessageCodec<Res>,
{
    pub(crate) fn new(stream: DuplexStream<ClientConn>, codec: C) -> Self {
        Self {
            stream,
            codec,
            _marker: PhantomData,
        }
    }

    pub async fn send(&self, message: &Req) -> Result<(), StreamError> {
        let data = MessageCodec::<Req>::marshal(&self.codec, message)?;
        self.stream.send(data).await
    }

    /// Half-close, wait for the single response and its trailers, then
    /// close the stream.
    pub async fn close_and_receive(self) -> Result<Response<Res>, StreamError> {
        self.stream.close_send();
        let result = self.receive_single().await;
        let closed = self.stream.close().await;
        let response = result?;
        closed?;
        Ok(response)
    }

    async fn receive_single(&self) -> Result<Response<Res>, StreamError> {
        let Some(message) = receive_message::<Res, C>(&self.stream, &self.codec).await? else {
            return Err(Status::unimplemented("server finished without a response message").into());
        };
        if receive_message::<Res, C>(&self.stream, &self.codec)
            .await?
            .is_some()
        {
            return Err(Status::unimplemented("server sent more than one response message").into());
        }
        let headers = self.stream.peer_headers().await?;
        let trailers = self.stream.trailers().cloned().unwrap_or_default();
        Ok(Response {
            message,
            headers,
            trailers,
        })
    }

    pub async fn response_headers(&self) -> Result<Metadata, StreamError> {
        self.stream.peer_headers().await
    }

    pub fn cancel(&self) -> StreamError {
        self.stream.cancel()
    }

    pub fn inner(&self) -> &DuplexStream<ClientConn> {
        &self.stream
    }
}

async fn receive_message<Res, C>(
    stream: &DuplexStream<ClientConn>,
    codec: &C,
) -> Result<Option<Res>, StreamError>
where
    C: MessageCodec<Res>,
{
    match stream.receive().await? {
        Some(data) => Ok(Some(codec.unmarshal(&data)?)),
        None => Ok(None),
    }
}
