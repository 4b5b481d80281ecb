#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::routing::post;
use connectrpc_duplex::{
    ChannelBody, Client, ClientProtocol, CompressionConfig, CompressionEncoding, HandlerStream,
    JsonCodec, ProtoCodec, Status, StreamConfig, serve_stream,
};
use http::Response;
use tokio::net::TcpListener;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const COUNT_UP: &str = "count.v1.CountService/CountUp";
pub const COUNT_UP_THEN_FAIL: &str = "count.v1.CountService/CountUpThenFail";
pub const ECHO: &str = "echo.v1.EchoService/Echo";
pub const COLLECT: &str = "echo.v1.EchoService/Collect";
pub const SAY: &str = "echo.v1.EchoService/Say";
pub const SAY_JSON: &str = "echo.v1.EchoService/SayJson";

/// Bound for every "returns promptly" check.
pub const BOUND: Duration = Duration::from_secs(1);

#[derive(Clone, PartialEq, prost::Message)]
pub struct CountUpRequest {
    #[prost(int64, tag = "1")]
    pub number: i64,
    /// Pause before every item after the first.
    #[prost(uint64, tag = "2")]
    pub delay_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CountUpResponse {
    #[prost(int64, tag = "1")]
    pub number: i64,
}

#[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
pub struct EchoMessage {
    #[prost(string, tag = "1")]
    pub text: String,
}

impl EchoMessage {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http1,
    H2c,
}

/// Every protocol over every transport it can run on. gRPC needs HTTP/2.
pub const CASES: [(ClientProtocol, Transport); 5] = [
    (ClientProtocol::Connect, Transport::Http1),
    (ClientProtocol::Connect, Transport::H2c),
    (ClientProtocol::GrpcWeb, Transport::Http1),
    (ClientProtocol::GrpcWeb, Transport::H2c),
    (ClientProtocol::Grpc, Transport::H2c),
];

/// Protocols that can stream in both directions at once.
pub const DUPLEX_CASES: [ClientProtocol; 3] = [
    ClientProtocol::Connect,
    ClientProtocol::GrpcWeb,
    ClientProtocol::Grpc,
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn client(url: &str, protocol: ClientProtocol, transport: Transport) -> Client {
    let builder = Client::builder(url).protocol(protocol);
    let builder = match transport {
        Transport::Http1 => builder,
        Transport::H2c => builder.http2_prior_knowledge(),
    };
    builder.build().expect("client should build")
}

/// What the server-side handlers observed.
#[derive(Default)]
pub struct ServerState {
    /// Signalled each time a handler stopped because its call was cancelled.
    pub handler_cancelled: Notify,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(&format!("/{COUNT_UP}"), post(count_up))
        .route(&format!("/{COUNT_UP_THEN_FAIL}"), post(count_up_then_fail))
        .route(&format!("/{ECHO}"), post(echo))
        .route(&format!("/{COLLECT}"), post(collect))
        .route(&format!("/{SAY}"), post(say))
        .route(&format!("/{SAY_JSON}"), post(say_json))
        .with_state(state)
}

async fn count(stream: &HandlerStream<CountUpRequest, CountUpResponse>) -> Result<(), Status> {
    let request = stream
        .receive()
        .await?
        .ok_or_else(|| Status::invalid_argument("missing request"))?;
    let delay = Duration::from_millis(request.delay_ms);
    for number in 1..=request.number {
        if number > 1 && !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stream.cancelled() => return Err(Status::cancelled("client went away")),
            }
        }
        stream.send(&CountUpResponse { number }).await?;
    }
    stream.set_trailer("x-count", &request.number.to_string())?;
    Ok(())
}

async fn count_up(State(state): State<Arc<ServerState>>, request: Request) -> Response<ChannelBody> {
    serve_stream(
        request,
        ProtoCodec,
        StreamConfig::default(),
        move |stream: HandlerStream<CountUpRequest, CountUpResponse>| async move {
            let result = count(&stream).await;
            if stream.is_cancelled() {
                state.handler_cancelled.notify_one();
            }
            result
        },
    )
    .await
}

async fn count_up_then_fail(request: Request) -> Response<ChannelBody> {
    serve_stream(
        request,
        ProtoCodec,
        StreamConfig::default(),
        |stream: HandlerStream<CountUpRequest, CountUpResponse>| async move {
            stream.receive().await?;
            stream.set_trailer("x-partial", "true")?;
            for number in 1..=2 {
                stream.send(&CountUpResponse { number }).await?;
            }
            Err(Status::resource_exhausted("quota used up"))
        },
    )
    .await
}

async fn echo(request: Request) -> Response<ChannelBody> {
    let config =
        StreamConfig::default().compression(CompressionConfig::new(CompressionEncoding::Gzip));
    serve_stream(
        request,
        ProtoCodec,
        config,
        |stream: HandlerStream<EchoMessage, EchoMessage>| async move {
            let mut count = 0;
            while let Some(message) = stream.receive().await? {
                count += 1;
                stream.send(&message).await?;
            }
            stream.set_trailer("x-echo-count", &count.to_string())?;
            Ok(())
        },
    )
    .await
}

async fn collect(request: Request) -> Response<ChannelBody> {
    serve_stream(
        request,
        ProtoCodec,
        StreamConfig::default(),
        |stream: HandlerStream<EchoMessage, EchoMessage>| async move {
            let mut texts = Vec::new();
            while let Some(message) = stream.receive().await? {
                texts.push(message.text);
            }
            stream
                .send(&EchoMessage {
                    text: texts.join(" "),
                })
                .await?;
            Ok(())
        },
    )
    .await
}

async fn answer<C>(stream: HandlerStream<EchoMessage, EchoMessage, C>) -> Result<(), Status>
where
    C: connectrpc_duplex::MessageCodec<EchoMessage>,
{
    let request = stream
        .receive()
        .await?
        .ok_or_else(|| Status::invalid_argument("missing request"))?;
    if request.text == "fail" {
        return Err(Status::not_found("no such text"));
    }
    stream.set_response_header("x-handler", "say")?;
    stream.set_trailer("x-said", "1")?;
    stream
        .send(&EchoMessage {
            text: format!("you said {}", request.text),
        })
        .await?;
    Ok(())
}

async fn say(request: Request) -> Response<ChannelBody> {
    serve_stream(request, ProtoCodec, StreamConfig::default(), answer).await
}

async fn say_json(request: Request) -> Response<ChannelBody> {
    serve_stream(request, JsonCodec, StreamConfig::default(), answer).await
}

/// An axum server on an ephemeral port speaking HTTP/1.1 and h2c.
pub struct TestServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start(router: Router) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting and wait, at most `bound`, for every connection to
    /// finish.
    pub async fn shutdown(self, bound: Duration) -> anyhow::Result<()> {
        let _ = self.shutdown.send(());
        let joined = tokio::time::timeout(bound, self.task)
            .await
            .map_err(|_| anyhow::anyhow!("server did not shut down within {bound:?}"))?;
        joined??;
        Ok(())
    }
}
