//! End-to-end calls of every shape over every protocol.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use connectrpc_duplex::{
    Client, ClientProtocol, Code, CompressionEncoding, ConnHooks, StreamError, StreamState,
};
use futures::TryStreamExt;
use tokio::time::timeout;

async fn start() -> anyhow::Result<TestServer> {
    init_tracing();
    TestServer::start(router(Arc::default())).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_stream_and_trailers() -> anyhow::Result<()> {
    let server = start().await?;

    for (protocol, transport) in CASES {
        let client = client(&server.url(), protocol, transport);
        let stream = client
            .call_server_stream::<CountUpRequest, CountUpResponse>(
                COUNT_UP,
                &CountUpRequest {
                    number: 3,
                    delay_ms: 0,
                },
            )
            .await?;

        for expected in 1..=3 {
            let item = stream.receive().await?.expect("item");
            assert_eq!(item.number, expected, "{protocol:?}/{transport:?}");
            assert!(stream.trailers().is_none());
        }
        assert!(stream.receive().await?.is_none());
        let trailers = stream.trailers().expect("trailers after the end");
        assert_eq!(trailers.get("x-count"), Some("3"), "{protocol:?}/{transport:?}");

        // The terminal result repeats.
        assert!(stream.receive().await?.is_none());
        stream.close().await?;
        assert_eq!(stream.inner().state(), StreamState::Closed);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_stream_error_after_messages() -> anyhow::Result<()> {
    let server = start().await?;

    for (protocol, transport) in CASES {
        let client = client(&server.url(), protocol, transport);
        let stream = client
            .call_server_stream::<CountUpRequest, CountUpResponse>(
                COUNT_UP_THEN_FAIL,
                &CountUpRequest::default(),
            )
            .await?;

        assert_eq!(stream.receive().await?.expect("first").number, 1);
        assert_eq!(stream.receive().await?.expect("second").number, 2);
        let err = stream.receive().await.expect_err("terminal error");
        assert_eq!(err.code(), Code::ResourceExhausted, "{protocol:?}/{transport:?}");
        let status = err.status().expect("peer status");
        assert_eq!(status.message(), Some("quota used up"));
        assert_eq!(
            stream.trailers().and_then(|t| t.get("x-partial")),
            Some("true")
        );

        // Later receives and close report the same error.
        let again = stream.receive().await.expect_err("repeated");
        assert_eq!(again.code(), Code::ResourceExhausted);
        let closed = stream.close().await.expect_err("close reports the error");
        assert_eq!(closed.code(), Code::ResourceExhausted);
        assert_eq!(stream.inner().state(), StreamState::Closed);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_stream_into_stream() -> anyhow::Result<()> {
    let server = start().await?;
    let client = client(&server.url(), ClientProtocol::Grpc, Transport::H2c);

    let stream = client
        .call_server_stream::<CountUpRequest, CountUpResponse>(
            COUNT_UP,
            &CountUpRequest {
                number: 5,
                delay_ms: 0,
            },
        )
        .await?;
    let numbers: Vec<i64> = stream
        .into_stream()
        .map_ok(|item| item.number)
        .try_collect()
        .await?;
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bidi_echo_with_half_close() -> anyhow::Result<()> {
    let server = start().await?;

    for protocol in DUPLEX_CASES {
        let client = client(&server.url(), protocol, Transport::H2c);
        let stream = client.call_bidi_stream::<EchoMessage, EchoMessage>(ECHO)?;

        for text in ["ping", "pong"] {
            stream.send(&EchoMessage::new(text)).await?;
            let reply = stream.receive().await?.expect("echo");
            assert_eq!(reply.text, text, "{protocol:?}");
        }

        // Half-close: the server sees the end of the requests and finishes.
        stream.close_send();
        assert!(stream.inner().is_send_closed());
        assert!(!stream.inner().is_receive_closed());
        assert!(matches!(
            stream.send(&EchoMessage::new("late")).await,
            Err(StreamError::SendAfterClose)
        ));

        assert!(stream.receive().await?.is_none());
        assert_eq!(
            stream.trailers().and_then(|t| t.get("x-echo-count")),
            Some("2"),
            "{protocol:?}"
        );
        stream.close().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bidi_send_and_receive_from_separate_tasks() -> anyhow::Result<()> {
    let server = start().await?;
    let client = client(&server.url(), ClientProtocol::Grpc, Transport::H2c);
    let stream = client.call_bidi_stream::<EchoMessage, EchoMessage>(ECHO)?;

    let sender = tokio::spawn({
        let stream = stream.clone();
        async move {
            for i in 0..10 {
                stream.send(&EchoMessage::new(&i.to_string())).await?;
            }
            stream.close_send();
            Ok::<_, StreamError>(())
        }
    });

    let mut received = Vec::new();
    while let Some(reply) = stream.receive().await? {
        received.push(reply.text);
    }
    sender.await??;
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(received, expected);
    stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_stream_collect() -> anyhow::Result<()> {
    let server = start().await?;

    for (protocol, transport) in CASES {
        let client = client(&server.url(), protocol, transport);
        let stream = client.call_client_stream::<EchoMessage, EchoMessage>(COLLECT)?;
        for text in ["one", "two", "three"] {
            stream.send(&EchoMessage::new(text)).await?;
        }
        let response = stream.close_and_receive().await?;
        assert_eq!(response.message().text, "one two three", "{protocol:?}/{transport:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unary_round_trip() -> anyhow::Result<()> {
    let server = start().await?;

    for (protocol, transport) in CASES {
        let client = client(&server.url(), protocol, transport);
        let response = client
            .call_unary::<EchoMessage, EchoMessage>(SAY, &EchoMessage::new("hi"))
            .await?;
        assert_eq!(response.message().text, "you said hi", "{protocol:?}/{transport:?}");
        assert_eq!(response.headers().get("x-handler"), Some("say"));
        assert_eq!(response.trailers().get("x-said"), Some("1"));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unary_error() -> anyhow::Result<()> {
    let server = start().await?;

    for (protocol, transport) in CASES {
        let client = client(&server.url(), protocol, transport);
        let err = client
            .call_unary::<EchoMessage, EchoMessage>(SAY, &EchoMessage::new("fail"))
            .await
            .expect_err("handler error");
        assert_eq!(err.code(), Code::NotFound, "{protocol:?}/{transport:?}");
        assert_eq!(
            err.status().and_then(|s| s.message()),
            Some("no such text")
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unary_json() -> anyhow::Result<()> {
    let server = start().await?;

    for (protocol, transport) in CASES {
        let client = Client::builder(server.url())
            .protocol(protocol)
            .use_json();
        let client = match transport {
            Transport::Http1 => client,
            Transport::H2c => client.http2_prior_knowledge(),
        }
        .build()?;
        let response = client
            .call_unary::<EchoMessage, EchoMessage>(SAY_JSON, &EchoMessage::new("json"))
            .await?;
        assert_eq!(response.message().text, "you said json", "{protocol:?}/{transport:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_codec_mismatch_is_rejected() -> anyhow::Result<()> {
    let server = start().await?;
    let client = Client::builder(server.url()).use_json().build()?;

    let err = client
        .call_unary::<EchoMessage, EchoMessage>(SAY, &EchoMessage::new("hi"))
        .await
        .expect_err("proto route rejects json");
    assert_eq!(err.code(), Code::Unknown);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_procedure_is_unimplemented() -> anyhow::Result<()> {
    let server = start().await?;

    let cases = [
        (ClientProtocol::Connect, Transport::Http1),
        (ClientProtocol::GrpcWeb, Transport::Http1),
        (ClientProtocol::Grpc, Transport::H2c),
    ];
    for (protocol, transport) in cases {
        let client = client(&server.url(), protocol, transport);
        let err = client
            .call_unary::<EchoMessage, EchoMessage>(
                "echo.v1.EchoService/Missing",
                &EchoMessage::new("hi"),
            )
            .await
            .expect_err("no such route");
        assert_eq!(err.code(), Code::Unimplemented, "{protocol:?}/{transport:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_max_bytes() -> anyhow::Result<()> {
    let server = start().await?;

    let client = Client::builder(server.url())
        .protocol(ClientProtocol::Grpc)
        .http2_prior_knowledge()
        .read_max_bytes(1)
        .build()?;
    let stream = client
        .call_server_stream::<CountUpRequest, CountUpResponse>(
            COUNT_UP,
            &CountUpRequest {
                number: 3,
                delay_ms: 0,
            },
        )
        .await?;
    let err = stream.receive().await.expect_err("oversized message");
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert!(matches!(err, StreamError::Envelope(_)));
    assert_eq!(stream.inner().state(), StreamState::Failed);

    let client = Client::builder(server.url()).read_max_bytes(4).build()?;
    let err = client
        .call_unary::<EchoMessage, EchoMessage>(SAY, &EchoMessage::new("hello"))
        .await
        .expect_err("oversized unary body");
    assert_eq!(err.code(), Code::ResourceExhausted);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_max_bytes() -> anyhow::Result<()> {
    let server = start().await?;
    let client = Client::builder(server.url())
        .protocol(ClientProtocol::Grpc)
        .http2_prior_knowledge()
        .send_max_bytes(4)
        .build()?;

    let stream = client.call_bidi_stream::<EchoMessage, EchoMessage>(ECHO)?;
    let err = stream
        .send(&EchoMessage::new("far too long"))
        .await
        .expect_err("oversized send");
    assert_eq!(err.code(), Code::ResourceExhausted);
    // The stream stays usable.
    stream.send(&EchoMessage::new("ok")).await?;
    assert_eq!(stream.receive().await?.expect("echo").text, "ok");
    stream.close_send();
    assert!(stream.receive().await?.is_none());
    stream.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_compression() -> anyhow::Result<()> {
    let server = start().await?;

    for (protocol, transport) in CASES {
        let builder = Client::builder(server.url())
            .protocol(protocol)
            .send_compression(CompressionEncoding::Gzip);
        let client = match transport {
            Transport::Http1 => builder,
            Transport::H2c => builder.http2_prior_knowledge(),
        }
        .build()?;

        let stream = client.call_client_stream::<EchoMessage, EchoMessage>(COLLECT)?;
        stream.send(&EchoMessage::new("squeezed")).await?;
        stream.send(&EchoMessage::new("words")).await?;
        let response = stream.close_and_receive().await?;
        assert_eq!(response.message().text, "squeezed words", "{protocol:?}/{transport:?}");

        let response = client
            .call_unary::<EchoMessage, EchoMessage>(SAY, &EchoMessage::new("zipped"))
            .await?;
        assert_eq!(response.message().text, "you said zipped");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refused_connection_fails_the_stream() -> anyhow::Result<()> {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}", listener.local_addr()?);
    drop(listener);

    for protocol in DUPLEX_CASES {
        let client = client(&url, protocol, Transport::H2c);
        let stream = client.call_bidi_stream::<EchoMessage, EchoMessage>(ECHO)?;
        // Give the connect attempt time to be refused.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = stream
            .send(&EchoMessage::new("hello"))
            .await
            .expect_err("nobody is listening");
        assert!(matches!(err, StreamError::Transport(_)), "{protocol:?}: {err:?}");
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(stream.inner().state(), StreamState::Failed);
        assert!(stream.inner().terminal_error().is_some());

        let closed = timeout(BOUND, stream.close()).await?;
        assert!(
            matches!(closed, Err(StreamError::Transport(_))),
            "{protocol:?}: {closed:?}"
        );
        let received = stream.receive().await;
        assert!(matches!(received, Err(StreamError::Transport(_))), "{received:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hooks_observe_both_heads() -> anyhow::Result<()> {
    let server = start().await?;

    for (protocol, transport) in CASES {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let hooks = ConnHooks::new()
            .on_request_send({
                let seen = seen.clone();
                move |parts| {
                    seen.lock().unwrap().push(format!("request {}", parts.uri.path()));
                }
            })
            .on_response_receive({
                let seen = seen.clone();
                move |head| {
                    let handler = head
                        .headers
                        .get("x-handler")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    seen.lock()
                        .unwrap()
                        .push(format!("response {} {handler}", head.status.as_u16()));
                }
            });
        let builder = Client::builder(server.url()).protocol(protocol).hooks(hooks);
        let client = match transport {
            Transport::Http1 => builder,
            Transport::H2c => builder.http2_prior_knowledge(),
        }
        .build()?;

        client
            .call_unary::<EchoMessage, EchoMessage>(SAY, &EchoMessage::new("hooked"))
            .await?;
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![format!("request /{SAY}"), "response 200 say".to_string()],
            "{protocol:?}/{transport:?}"
        );
    }
    Ok(())
}
