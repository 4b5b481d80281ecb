//! Background task that drives the peer's body.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::HeaderMap;
use http_body::Body;
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::{ConnError, lock};

/// What the pump hands to the reader.
#[derive(Debug)]
pub(crate) enum PumpEvent {
    Data(Bytes),
    End(Option<HeaderMap>),
    Error(String),
}

/// Owns the task reading the peer's body.
///
/// The task owns the HTTP exchange (the response future on the client, the
/// request body in a handler). Aborting it drops the peer's body, which is
/// what releases the connection. `finished` resolves when the task is gone,
/// whether it ran to completion or was aborted.
#[derive(Debug)]
pub(crate) struct BodyPump {
    events: tokio::sync::Mutex<mpsc::Receiver<PumpEvent>>,
    trailers: Mutex<Option<HeaderMap>>,
    ended: AtomicBool,
    task: Mutex<Option<AbortHandle>>,
    done: CancellationToken,
    cancel: CancellationToken,
}

impl BodyPump {
    /// Spawn `task` with the event sender.
    pub(crate) fn spawn<F, Fut>(cancel: CancellationToken, capacity: usize, task: F) -> Self
    where
        F: FnOnce(mpsc::Sender<PumpEvent>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let done = CancellationToken::new();
        let guard = done.clone().drop_guard();
        let fut = task(tx);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
        Self {
            events: tokio::sync::Mutex::new(rx),
            trailers: Mutex::new(None),
            ended: AtomicBool::new(false),
            task: Mutex::new(Some(handle.abort_handle())),
            done,
            cancel,
        }
    }

    pub(crate) async fn read(&self) -> Result<Option<Bytes>, ConnError> {
        if self.ended.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut events = self.events.lock().await;
        if self.ended.load(Ordering::Acquire) {
            return Ok(None);
        }
        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ConnError::Canceled),
            event = events.recv() => event,
        };
        match event {
            Some(PumpEvent::Data(data)) => Ok(Some(data)),
            Some(PumpEvent::End(trailers)) => {
                *lock(&self.trailers) = trailers;
                self.ended.store(true, Ordering::Release);
                Ok(None)
            }
            Some(PumpEvent::Error(message)) => Err(ConnError::Transport(message)),
            None if self.cancel.is_cancelled() => Err(ConnError::Canceled),
            None => Err(ConnError::Closed),
        }
    }

    pub(crate) fn trailers(&self) -> Option<HeaderMap> {
        lock(&self.trailers).clone()
    }

    pub(crate) fn abort(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    pub(crate) async fn finished(&self) {
        self.done.cancelled().await
    }
}

impl Drop for BodyPump {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Forward every frame of `body` as pump events.
///
/// Stops early if the reader side is gone.
pub(crate) async fn pump_body<B>(body: B, events: mpsc::Sender<PumpEvent>)
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    loop {
        let event = match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) if data.is_empty() => continue,
                Ok(data) => PumpEvent::Data(data),
                Err(frame) => match frame.into_trailers() {
                    Ok(trailers) => PumpEvent::End(Some(trailers)),
                    Err(_) => continue,
                },
            },
            Some(Err(err)) => PumpEvent::Error(err.to_string()),
            None => PumpEvent::End(None),
        };
        let last = !matches!(event, PumpEvent::Data(_));
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Full, StreamBody};
    use http_body::Frame;

    #[tokio::test]
    async fn test_pumps_data_and_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        let frames = vec![
            Ok::<_, std::convert::Infallible>(Frame::data(Bytes::from_static(b"ab"))),
            Ok(Frame::data(Bytes::from_static(b"cd"))),
            Ok(Frame::trailers(trailers)),
        ];
        let body = StreamBody::new(futures::stream::iter(frames));
        let pump = BodyPump::spawn(CancellationToken::new(), 4, |events| pump_body(body, events));

        assert_eq!(pump.read().await.unwrap().unwrap(), "ab");
        assert_eq!(pump.read().await.unwrap().unwrap(), "cd");
        assert_eq!(pump.read().await.unwrap(), None);
        assert_eq!(pump.read().await.unwrap(), None);
        assert_eq!(pump.trailers().unwrap()["grpc-status"], "0");
        pump.finished().await;
        assert!(pump.is_finished());
    }

    #[tokio::test]
    async fn test_end_without_trailers() {
        let body = Full::new(Bytes::from_static(b"body"));
        let pump = BodyPump::spawn(CancellationToken::new(), 4, |events| pump_body(body, events));
        assert_eq!(pump.read().await.unwrap().unwrap(), "body");
        assert_eq!(pump.read().await.unwrap(), None);
        assert!(pump.trailers().is_none());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_read_and_abort_finishes() {
        let cancel = CancellationToken::new();
        let pump = BodyPump::spawn(cancel.clone(), 4, |_events| std::future::pending::<()>());
        cancel.cancel();
        assert_eq!(pump.read().await, Err(ConnError::Canceled));
        assert!(!pump.is_finished());
        pump.abort();
        pump.finished().await;
    }
}
