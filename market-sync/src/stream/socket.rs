use super::{CloseInfo, SocketEvent, StreamEvent, timeout::IdleTimeout};
use crate::config::StreamConfig;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};
use url::Url;

/// Everything a socket task needs to open one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    /// Tag attached to every event this socket reports
    pub generation: u64,
    pub url: Url,
    /// Text frames sent once the socket is open
    pub subscribe: Vec<String>,
    /// Application keepalive text, WebSocket ping frames when `None`
    pub ping: Option<String>,
}

/// Opens sockets. The production implementation is [`TungsteniteConnector`].
pub trait StreamConnector: Send + Sync {
    /// Start a socket task reporting through `events` and return its handle.
    fn open(&self, request: ConnectRequest, events: mpsc::UnboundedSender<StreamEvent>) -> SocketHandle;
}

/// Owned handle to a running socket task.
///
/// Dropping the handle without calling [`SocketHandle::close`] aborts the task.
#[derive(Debug)]
pub struct SocketHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SocketHandle {
    pub fn new(shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Ask the task to send a normal close frame and finish on its own.
    pub fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            if shutdown.send(()).is_err() {
                self.task.abort();
            }
        }
    }

}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}

/// [`StreamConnector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
    idle_timeout: Duration,
    ping_interval: Duration,
}

impl TungsteniteConnector {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            ping_interval: config.ping_interval,
        }
    }
}

impl StreamConnector for TungsteniteConnector {
    fn open(&self, request: ConnectRequest, events: mpsc::UnboundedSender<StreamEvent>) -> SocketHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_socket(self.clone(), request, events, shutdown_rx));
        SocketHandle::new(shutdown_tx, task)
    }
}

/// Drive one socket from connect to close, reporting every transition.
///
/// The final event is always `Closed`.
async fn run_socket(
    connector: TungsteniteConnector,
    request: ConnectRequest,
    events: mpsc::UnboundedSender<StreamEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let ConnectRequest {
        generation,
        url,
        subscribe,
        ping,
    } = request;
    let emit = |kind: SocketEvent| {
        let _ = events.send(StreamEvent::new(generation, kind));
    };

    debug!(generation, %url, "connecting stream");
    let connect = tokio::time::timeout(connector.connect_timeout, connect_async(url.as_str()));
    let ws_stream = tokio::select! {
        _ = &mut shutdown => {
            emit(SocketEvent::Closed(CloseInfo::intentional()));
            return;
        }
        result = connect => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(error)) => {
                emit(SocketEvent::Errored(format!("connect failed: {error}")));
                emit(SocketEvent::Closed(CloseInfo::abnormal()));
                return;
            }
            Err(_) => {
                emit(SocketEvent::Errored(format!(
                    "connect timed out after {:?}",
                    connector.connect_timeout
                )));
                emit(SocketEvent::Closed(CloseInfo::abnormal()));
                return;
            }
        }
    };

    info!(generation, %url, "stream connected");
    emit(SocketEvent::Opened);

    let (mut write, read) = ws_stream.split();

    for text in subscribe {
        if let Err(error) = write.send(Message::text(text)).await {
            emit(SocketEvent::Errored(format!("subscribe send failed: {error}")));
            emit(SocketEvent::Closed(CloseInfo::abnormal()));
            return;
        }
    }

    let mut read = IdleTimeout::new(read, connector.idle_timeout);
    let mut keepalive = tokio::time::interval(connector.ping_interval);
    keepalive.tick().await;

    let close = loop {
        tokio::select! {
            _ = &mut shutdown => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closing".into(),
                };
                if let Err(error) = write.send(Message::Close(Some(frame))).await {
                    debug!(generation, %error, "close frame not delivered");
                }
                break CloseInfo::intentional();
            }
            _ = keepalive.tick() => {
                let message = match &ping {
                    Some(text) => Message::text(text.clone()),
                    None => Message::Ping(Vec::new().into()),
                };
                if let Err(error) = write.send(message).await {
                    emit(SocketEvent::Errored(format!("keepalive send failed: {error}")));
                    break CloseInfo::abnormal();
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => emit(SocketEvent::Message(text.as_str().to_owned())),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map_or(1005, |frame| u16::from(frame.code));
                    info!(generation, code, "stream closed by server");
                    break CloseInfo::remote(code);
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    emit(SocketEvent::Errored(error.to_string()));
                    break CloseInfo::abnormal();
                }
                None => {
                    if read.timed_out() {
                        emit(SocketEvent::Errored("idle timeout".to_string()));
                    } else {
                        warn!(generation, "stream ended without close frame");
                    }
                    break CloseInfo::abnormal();
                }
            }
        }
    };

    emit(SocketEvent::Closed(close));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_lets_task_finish() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = shutdown_rx.await;
            let _ = done_tx.send(());
        });

        SocketHandle::new(shutdown_tx, task).close();

        assert!(done_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_aborts_task() {
        let (shutdown_tx, _shutdown_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            std::future::pending::<()>().await;
            let _ = done_tx.send(());
        });

        drop(SocketHandle::new(shutdown_tx, task));

        // Sender dropped by the aborted task without sending
        assert!(done_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_abnormal_close() {
        let connector = TungsteniteConnector::new(&StreamConfig::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let request = ConnectRequest {
            generation: 7,
            url: Url::parse("ws://127.0.0.1:9/stream").unwrap(),
            subscribe: vec![],
            ping: None,
        };

        let _handle = connector.open(request, events_tx);

        let first = events_rx.recv().await.unwrap();
        assert_eq!(first.generation, 7);
        assert!(matches!(first.kind, SocketEvent::Errored(_)));
        assert_eq!(
            events_rx.recv().await.unwrap(),
            StreamEvent::new(7, SocketEvent::Closed(CloseInfo::abnormal()))
        );
    }
}
