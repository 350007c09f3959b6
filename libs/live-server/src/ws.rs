use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use super::AppState;

// ═══════════════════════════════════════════════════════════════
//  Timing
// ═══════════════════════════════════════════════════════════════

/// Liveness and delivery deadlines for one subscriber connection.
#[derive(Debug, Clone, Copy)]
pub struct WsTiming {
    /// Ping cadence while no outbound events are flowing.
    pub keepalive_period: Duration,
    /// Deadline for completing any single frame write.
    pub write_timeout: Duration,
    /// Max silence on the read side (any frame, pong included, resets it).
    pub read_timeout: Duration,
}

impl Default for WsTiming {
    fn default() -> Self {
        Self {
            keepalive_period: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Connection handler
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| subscriber_connection(socket, state))
}

/// One live subscriber: a write pump draining the broker-fed outbound
/// buffer and a read pump watching liveness. Whichever pump exits first
/// tears the other down; the subscriber always unregisters through the
/// broker's control loop.
async fn subscriber_connection(socket: WebSocket, state: AppState) {
    let Some((id, outbound)) = state.broker.register().await else {
        tracing::warn!("broker unavailable, refusing subscriber");
        return;
    };
    tracing::info!(subscriber = id, "subscriber connected");

    let (sink, stream) = socket.split();
    let mut write = tokio::spawn(write_pump(sink, outbound, state.timing));
    let mut read = tokio::spawn(read_pump(stream, state.timing.read_timeout));

    tokio::select! {
        _ = &mut write => read.abort(),
        _ = &mut read => write.abort(),
    }

    state.broker.unregister(id).await;
    tracing::info!(subscriber = id, "subscriber disconnected");
}

/// Drain the outbound buffer into the socket; ping when idle. Every
/// write carries the frame deadline. A closed outbound buffer means the
/// broker dropped us (overflow or shutdown): send Close and finish.
async fn write_pump<S>(mut sink: S, mut outbound: mpsc::Receiver<String>, timing: WsTiming)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + timing.keepalive_period,
        timing.keepalive_period,
    );

    loop {
        tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => {
                    if send_frame(&mut sink, Message::Text(payload.into()), timing.write_timeout)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                None => {
                    let _ = send_frame(&mut sink, Message::Close(None), timing.write_timeout).await;
                    return;
                }
            },
            _ = keepalive.tick() => {
                if send_frame(&mut sink, Message::Ping(Default::default()), timing.write_timeout)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: Message, deadline: Duration) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match tokio::time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "write failed");
            Err(())
        }
        Err(_) => {
            tracing::warn!("write deadline exceeded");
            Err(())
        }
    }
}

/// Liveness only: client frames are never interpreted as commands, they
/// just reset the read deadline. Silence past the deadline, a Close
/// frame, or a transport error ends the connection.
async fn read_pump<S, E>(mut stream: S, read_timeout: Duration)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    loop {
        match tokio::time::timeout(read_timeout, stream.next()).await {
            Err(_) => {
                tracing::debug!("read deadline exceeded");
                return;
            }
            Ok(None) | Ok(Some(Err(_))) => return,
            Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(_))) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    fn timing() -> WsTiming {
        WsTiming::default()
    }

    /// Sink whose writes never complete; models a peer that stops
    /// reading mid-frame.
    struct StuckSink;

    impl Sink<Message> for StuckSink {
        type Error = Infallible;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Infallible>> {
            std::task::Poll::Pending
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _item: Message) -> Result<(), Infallible> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Infallible>> {
            std::task::Poll::Pending
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Infallible>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_outbound_payloads_as_text() {
        let (frames_tx, mut frames_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (out_tx, out_rx) = mpsc::channel(4);
        tokio::spawn(write_pump(frames_tx, out_rx, timing()));

        out_tx.send("{\"busId\":\"bus-1\"}".to_string()).await.unwrap();
        match frames_rx.next().await.unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "{\"busId\":\"bus-1\"}"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    // An idle connection gets a ping once the keepalive period
    // elapses with no outbound events.
    #[tokio::test(start_paused = true)]
    async fn idle_connection_receives_keepalive_ping() {
        let (frames_tx, mut frames_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (_out_tx, out_rx) = mpsc::channel::<String>(4);
        tokio::spawn(write_pump(frames_tx, out_rx, timing()));

        let started = tokio::time::Instant::now();
        match frames_rx.next().await.unwrap() {
            Message::Ping(_) => {}
            other => panic!("expected ping frame, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(54));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_outbound_buffer_sends_close_frame() {
        let (frames_tx, mut frames_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (out_tx, out_rx) = mpsc::channel::<String>(4);
        let pump = tokio::spawn(write_pump(frames_tx, out_rx, timing()));

        drop(out_tx);
        match frames_rx.next().await.unwrap() {
            Message::Close(_) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
        pump.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_write_hits_the_deadline() {
        let (out_tx, out_rx) = mpsc::channel(4);
        let pump = tokio::spawn(write_pump(StuckSink, out_rx, timing()));

        let started = tokio::time::Instant::now();
        out_tx.send("payload".to_string()).await.unwrap();
        pump.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    // A silent read side closes the connection after the deadline.
    #[tokio::test(start_paused = true)]
    async fn silent_reader_is_closed_after_deadline() {
        let silent = stream::pending::<Result<Message, Infallible>>();
        let started = tokio::time::Instant::now();
        read_pump(silent, timing().read_timeout).await;
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_frames_only_reset_the_deadline() {
        let frames = stream::iter(vec![
            Ok::<Message, Infallible>(Message::Pong(Default::default())),
            Ok(Message::Text("ignored client chatter".into())),
        ])
        .chain(stream::pending());

        let started = tokio::time::Instant::now();
        read_pump(frames, timing().read_timeout).await;
        // Both frames consumed without acting on them, then the deadline.
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn client_close_frame_ends_the_read_pump() {
        let frames = stream::iter(vec![Ok::<Message, Infallible>(Message::Close(None))])
            .chain(stream::pending());
        read_pump(frames, timing().read_timeout).await;
    }
}
