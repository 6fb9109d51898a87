//! The stream driver.
//!
//! Bridges a transport's raw byte stream to typed, codec-aware messages.
//! Two cooperating halves attach to every stream: the send path
//! (serialize → request-body chain → transport writes) and a receive pump
//! task (frame splitting → stream-result chain → deserialize → bounded
//! channel to the caller). Backpressure on the receive side is the
//! caller's receive rate.
//!
//! State machine: `Open` moves to `HalfClosedLocal` on `send_close` or
//! `HalfClosedRemote` on a received completion, then to `Closed` when
//! both halves are done. Cancellation jumps straight to `Closed`, aborts
//! the transport, and emits `Complete(CANCELED)` exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tracing::debug;
use triwire_core::{
    Code, Codec, Completion, ConnectError, FrameBuffer, Headers, StreamResult,
};

use crate::interceptor::{RequestBodyFunction, StreamFunction, StreamResultFunction};
use crate::response::ResponseMessage;
use crate::transport::{TransportStream, WriteFrame};

/// Capacity of the typed result channel handed to the caller.
const RESULT_CHANNEL_CAPACITY: usize = 16;

/// Where a stream is in its lifecycle. Transitions are monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

struct StreamShared {
    state: Mutex<StreamState>,
    /// Set once a terminal `Complete` has been emitted (or claimed).
    completed: AtomicBool,
    cancel: Notify,
    abort: crate::transport::AbortHandle,
}

impl StreamShared {
    fn state(&self) -> MutexGuard<'_, StreamState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_send_open(&self) -> Result<(), ConnectError> {
        match *self.state() {
            StreamState::Open | StreamState::HalfClosedRemote => Ok(()),
            StreamState::HalfClosedLocal | StreamState::Closed => Err(ConnectError::new(
                Code::FailedPrecondition,
                "cannot send on a closed stream",
            )),
        }
    }

    /// Returns false if the local half was already closed.
    fn close_local(&self) -> bool {
        let mut state = self.state();
        match *state {
            StreamState::Open => {
                *state = StreamState::HalfClosedLocal;
                true
            }
            StreamState::HalfClosedRemote => {
                *state = StreamState::Closed;
                true
            }
            StreamState::HalfClosedLocal | StreamState::Closed => false,
        }
    }

    fn close_remote(&self) {
        let mut state = self.state();
        *state = match *state {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        };
    }

    fn close(&self) {
        *self.state() = StreamState::Closed;
    }

    /// Claim the right to emit the terminal completion. Only one caller
    /// ever wins.
    fn claim_completion(&self) -> bool {
        !self.completed.swap(true, Ordering::SeqCst)
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

/// The caller's handle to a bidirectional stream: send typed requests,
/// receive typed results, close either half.
pub struct BidirectionalStream<Req, Res> {
    sender: StreamSender<Req>,
    receiver: StreamReceiver<Res>,
}

impl<Req, Res> BidirectionalStream<Req, Res>
where
    Res: Send + 'static,
{
    /// Wire a transport stream to the caller: spawn the receive pump and
    /// hand back the typed handle.
    pub(crate) fn spawn(
        transport: TransportStream,
        functions: StreamFunction,
        request_codec: Arc<dyn Codec<Req>>,
        response_codec: Arc<dyn Codec<Res>>,
        deadline: Option<tokio::time::Instant>,
    ) -> Self {
        let shared = Arc::new(StreamShared {
            state: Mutex::new(StreamState::Open),
            completed: AtomicBool::new(false),
            cancel: Notify::new(),
            abort: transport.abort.clone(),
        });

        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        tokio::spawn(run_receive_pump(
            transport.results,
            functions.stream_result,
            response_codec,
            tx,
            shared.clone(),
            deadline,
        ));

        Self {
            sender: StreamSender {
                writes: transport.writes,
                request_codec,
                body_function: Arc::new(Mutex::new(functions.request_body)),
                shared: shared.clone(),
            },
            receiver: StreamReceiver { results: rx, shared },
        }
    }
}

impl<Req, Res> BidirectionalStream<Req, Res> {
    /// Serialize and send one message.
    ///
    /// Fails with `FAILED_PRECONDITION` after the send half is closed. A
    /// serialization failure is returned to the caller and leaves the
    /// stream usable.
    pub async fn send(&self, message: &Req) -> Result<(), ConnectError> {
        self.sender.send(message).await
    }

    /// Close the send half. Idempotent.
    pub async fn send_close(&self) -> Result<(), ConnectError> {
        self.sender.send_close().await
    }

    /// Receive the next stream result. `None` once the terminal
    /// completion has been consumed.
    pub async fn receive(&mut self) -> Option<StreamResult<Res>> {
        self.receiver.receive().await
    }

    /// Cancel the stream: abort the transport and surface
    /// `Complete(CANCELED)` if the stream had not already terminated.
    pub fn receive_close(&self) {
        self.receiver.receive_close()
    }

    pub fn is_send_closed(&self) -> bool {
        matches!(
            *self.sender.shared.state(),
            StreamState::HalfClosedLocal | StreamState::Closed
        )
    }

    pub fn is_receive_closed(&self) -> bool {
        self.receiver.shared.is_completed()
    }

    pub fn is_closed(&self) -> bool {
        *self.sender.shared.state() == StreamState::Closed
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (StreamSender<Req>, StreamReceiver<Res>) {
        (self.sender, self.receiver)
    }
}

/// The send half of a stream. Cloneable; all clones share the same
/// underlying write channel and state.
pub struct StreamSender<Req> {
    writes: mpsc::Sender<WriteFrame>,
    request_codec: Arc<dyn Codec<Req>>,
    body_function: Arc<Mutex<RequestBodyFunction>>,
    shared: Arc<StreamShared>,
}

impl<Req> Clone for StreamSender<Req> {
    fn clone(&self) -> Self {
        Self {
            writes: self.writes.clone(),
            request_codec: self.request_codec.clone(),
            body_function: self.body_function.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<Req> StreamSender<Req> {
    pub async fn send(&self, message: &Req) -> Result<(), ConnectError> {
        self.shared.ensure_send_open()?;
        let bytes = self.request_codec.serialize(message)?;
        let framed = {
            let mut function = match self.body_function.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            function(bytes)?
        };
        self.writes
            .send(WriteFrame::Data(framed))
            .await
            .map_err(|_| ConnectError::transport("stream write half closed"))
    }

    pub async fn send_close(&self) -> Result<(), ConnectError> {
        if !self.shared.close_local() {
            return Ok(());
        }
        // The transport may already be gone (remote completion, cancel);
        // closing an absent write half is not an error.
        let _ = self.writes.send(WriteFrame::Close).await;
        Ok(())
    }
}

/// The receive half of a stream.
pub struct StreamReceiver<Res> {
    results: mpsc::Receiver<StreamResult<Res>>,
    shared: Arc<StreamShared>,
}

impl<Res> StreamReceiver<Res> {
    pub async fn receive(&mut self) -> Option<StreamResult<Res>> {
        self.results.recv().await
    }

    pub fn receive_close(&self) {
        self.shared.close();
        self.shared.cancel.notify_one();
    }
}

async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// The receive pump: transport events in, typed results out.
async fn run_receive_pump<Res>(
    mut transport_results: mpsc::Receiver<StreamResult<Bytes>>,
    mut stream_result: StreamResultFunction,
    response_codec: Arc<dyn Codec<Res>>,
    tx: mpsc::Sender<StreamResult<Res>>,
    shared: Arc<StreamShared>,
    deadline: Option<tokio::time::Instant>,
) where
    Res: Send + 'static,
{
    let mut frames = FrameBuffer::new();

    loop {
        tokio::select! {
            biased;

            _ = shared.cancel.notified() => {
                shared.abort.abort();
                if shared.claim_completion() {
                    let _ = tx
                        .send(StreamResult::Complete(Completion::from_error(
                            ConnectError::new(Code::Canceled, "canceled by caller"),
                        )))
                        .await;
                }
                debug!("stream canceled by caller");
                break;
            }

            _ = deadline_elapsed(deadline) => {
                shared.close();
                shared.abort.abort();
                if shared.claim_completion() {
                    let _ = tx
                        .send(StreamResult::Complete(Completion::from_error(
                            ConnectError::new(Code::DeadlineExceeded, "deadline exceeded"),
                        )))
                        .await;
                }
                debug!("stream deadline exceeded");
                break;
            }

            raw = transport_results.recv() => {
                match raw {
                    None => {
                        // Transport EOF with no terminal result.
                        if shared.claim_completion() {
                            shared.close_remote();
                            let _ = tx
                                .send(StreamResult::Complete(Completion::from_error(
                                    ConnectError::new(
                                        Code::Unknown,
                                        "stream closed without a completion",
                                    ),
                                )))
                                .await;
                        }
                        break;
                    }
                    Some(StreamResult::Message(chunk)) => {
                        frames.extend(&chunk);
                        let mut terminated = false;
                        while let Some(frame) = frames.next_frame() {
                            let result = stream_result(StreamResult::Message(frame));
                            if forward(result, &response_codec, &tx, &shared).await.is_none() {
                                terminated = true;
                                break;
                            }
                        }
                        if terminated {
                            break;
                        }
                    }
                    Some(other) => {
                        let result = stream_result(other);
                        if forward(result, &response_codec, &tx, &shared).await.is_none() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Deliver one chain-transformed result to the caller. Returns `None`
/// once the stream has terminated and the pump should stop.
async fn forward<Res>(
    result: StreamResult<Bytes>,
    response_codec: &Arc<dyn Codec<Res>>,
    tx: &mpsc::Sender<StreamResult<Res>>,
    shared: &Arc<StreamShared>,
) -> Option<()> {
    match result {
        StreamResult::Headers(headers) => {
            if shared.is_completed() {
                return Some(());
            }
            tx.send(StreamResult::Headers(headers)).await.ok().or_else(|| {
                shared.abort.abort();
                None
            })
        }
        StreamResult::Message(payload) => {
            // Anything arriving after the terminal completion is dropped.
            if shared.is_completed() {
                return Some(());
            }
            match response_codec.deserialize(&payload) {
                Ok(message) => {
                    tx.send(StreamResult::Message(message)).await.ok().or_else(|| {
                        shared.abort.abort();
                        None
                    })
                }
                Err(error) => {
                    shared.abort.abort();
                    if shared.claim_completion() {
                        shared.close_remote();
                        let error = ConnectError::new(
                            Code::Internal,
                            "failed to decode response message",
                        )
                        .with_source(error);
                        let _ = tx
                            .send(StreamResult::Complete(Completion::from_error(error)))
                            .await;
                    }
                    None
                }
            }
        }
        StreamResult::Complete(completion) => {
            if shared.claim_completion() {
                shared.close_remote();
                let _ = tx.send(StreamResult::Complete(completion)).await;
            }
            None
        }
    }
}

/// A server-streaming call: one request already sent, many responses.
pub struct ServerOnlyStream<Req, Res> {
    inner: BidirectionalStream<Req, Res>,
}

impl<Req, Res> ServerOnlyStream<Req, Res> {
    pub(crate) fn new(inner: BidirectionalStream<Req, Res>) -> Self {
        Self { inner }
    }

    pub async fn receive(&mut self) -> Option<StreamResult<Res>> {
        self.inner.receive().await
    }

    pub fn receive_close(&self) {
        self.inner.receive_close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// A client-streaming call: many requests, one response collected by
/// [`close_and_receive`](ClientOnlyStream::close_and_receive).
pub struct ClientOnlyStream<Req, Res> {
    inner: BidirectionalStream<Req, Res>,
}

impl<Req, Res> ClientOnlyStream<Req, Res> {
    pub(crate) fn new(inner: BidirectionalStream<Req, Res>) -> Self {
        Self { inner }
    }

    pub async fn send(&self, message: &Req) -> Result<(), ConnectError> {
        self.inner.send(message).await
    }

    /// Close the send half and wait for the single response.
    pub async fn close_and_receive(&mut self) -> ResponseMessage<Res> {
        let mut headers = Headers::new();
        let mut message: Option<Res> = None;
        let mut extra_message = false;

        if let Err(error) = self.inner.send_close().await {
            return ResponseMessage {
                headers,
                trailers: Headers::new(),
                result: Err(error),
            };
        }

        loop {
            match self.inner.receive().await {
                Some(StreamResult::Headers(h)) => headers = h,
                Some(StreamResult::Message(m)) => {
                    if message.is_none() {
                        message = Some(m);
                    } else {
                        extra_message = true;
                    }
                }
                Some(StreamResult::Complete(completion)) => {
                    let result = match completion.error {
                        Some(error) => Err(error),
                        None if extra_message => Err(ConnectError::new(
                            Code::Unimplemented,
                            "unary response has multiple messages",
                        )),
                        None => message.take().ok_or_else(|| {
                            ConnectError::protocol("response message missing")
                        }),
                    };
                    return ResponseMessage {
                        headers,
                        trailers: completion.trailers,
                        result,
                    };
                }
                None => {
                    return ResponseMessage {
                        headers,
                        trailers: Headers::new(),
                        result: Err(ConnectError::new(
                            Code::Unknown,
                            "stream closed without a completion",
                        )),
                    };
                }
            }
        }
    }

    pub fn receive_close(&self) {
        self.inner.receive_close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::StreamFunction;
    use crate::transport::AbortHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use triwire_core::pack;

    /// Codec over UTF-8 strings, enough to watch bytes become values.
    struct TextCodec;

    impl Codec<String> for TextCodec {
        fn encoding_name(&self) -> &'static str {
            "text"
        }

        fn serialize(&self, message: &String) -> Result<Bytes, ConnectError> {
            Ok(Bytes::from(message.clone()))
        }

        fn deserialize(&self, bytes: &Bytes) -> Result<String, ConnectError> {
            String::from_utf8(bytes.to_vec())
                .map_err(|e| ConnectError::serialization(e.to_string()))
        }
    }

    struct TestTransport {
        stream: TransportStream,
        raw_tx: mpsc::Sender<StreamResult<Bytes>>,
        aborts: Arc<AtomicUsize>,
        /// Held open so sends on the stream's write half succeed.
        _writes: mpsc::Receiver<WriteFrame>,
    }

    fn test_transport() -> TestTransport {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (write_tx, write_rx) = mpsc::channel(16);
        let aborts = Arc::new(AtomicUsize::new(0));
        let abort_count = aborts.clone();
        TestTransport {
            stream: TransportStream {
                writes: write_tx,
                results: raw_rx,
                abort: AbortHandle::new(move || {
                    abort_count.fetch_add(1, Ordering::SeqCst);
                }),
            },
            raw_tx,
            aborts,
            _writes: write_rx,
        }
    }

    /// A chain that unwraps envelope frames, like the protocol
    /// interceptors do, without any protocol-specific headers.
    fn unwrapping_functions() -> StreamFunction {
        StreamFunction {
            request: Box::new(|request| Ok(request)),
            request_body: Box::new(|body| pack(&body, None).map_err(Into::into)),
            stream_result: Box::new(|result| match result {
                StreamResult::Message(frame) => {
                    match triwire_core::unpack_with_header_byte(&frame, None) {
                        Ok(message) => StreamResult::Message(message.payload),
                        Err(e) => StreamResult::Complete(Completion::from_error(e.into())),
                    }
                }
                other => other,
            }),
        }
    }

    fn spawn_stream(
        transport: TransportStream,
    ) -> BidirectionalStream<String, String> {
        BidirectionalStream::spawn(
            transport,
            unwrapping_functions(),
            Arc::new(TextCodec),
            Arc::new(TextCodec),
            None,
        )
    }

    #[tokio::test]
    async fn test_ordered_delivery() {
        let transport = test_transport();
        let raw_tx = transport.raw_tx.clone();
        let mut stream = spawn_stream(transport.stream);

        let mut headers = Headers::new();
        headers.insert("x-id", "42");
        raw_tx.send(StreamResult::Headers(headers)).await.unwrap();
        raw_tx
            .send(StreamResult::Message(pack(b"first", None).unwrap().into()))
            .await
            .unwrap();
        raw_tx
            .send(StreamResult::Message(pack(b"second", None).unwrap().into()))
            .await
            .unwrap();
        raw_tx
            .send(StreamResult::Complete(Completion::ok(Headers::new())))
            .await
            .unwrap();

        match stream.receive().await.unwrap() {
            StreamResult::Headers(h) => assert_eq!(h.get("x-id"), Some("42")),
            other => panic!("expected Headers, got {other:?}"),
        }
        match stream.receive().await.unwrap() {
            StreamResult::Message(m) => assert_eq!(m, "first"),
            other => panic!("expected Message, got {other:?}"),
        }
        match stream.receive().await.unwrap() {
            StreamResult::Message(m) => assert_eq!(m, "second"),
            other => panic!("expected Message, got {other:?}"),
        }
        match stream.receive().await.unwrap() {
            StreamResult::Complete(c) => assert!(c.is_ok()),
            other => panic!("expected Complete, got {other:?}"),
        }
        assert!(stream.receive().await.is_none());
        assert!(stream.is_receive_closed());
    }

    #[tokio::test]
    async fn test_chunked_frames_across_transport_reads() {
        let transport = test_transport();
        let raw_tx = transport.raw_tx.clone();
        let mut stream = spawn_stream(transport.stream);

        let frame = pack(b"split me", None).unwrap();
        raw_tx
            .send(StreamResult::Message(frame.slice(..3)))
            .await
            .unwrap();
        raw_tx
            .send(StreamResult::Message(frame.slice(3..)))
            .await
            .unwrap();
        raw_tx
            .send(StreamResult::Complete(Completion::ok(Headers::new())))
            .await
            .unwrap();

        match stream.receive().await.unwrap() {
            StreamResult::Message(m) => assert_eq!(m, "split me"),
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let transport = test_transport();
        let stream = spawn_stream(transport.stream);

        stream.send(&"hello".to_string()).await.unwrap();
        stream.send_close().await.unwrap();
        assert!(stream.is_send_closed());

        let err = stream.send(&"late".to_string()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        // Closing again is a no-op.
        stream.send_close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_emits_canceled_once() {
        let transport = test_transport();
        let raw_tx = transport.raw_tx.clone();
        let aborts = transport.aborts.clone();
        let mut stream = spawn_stream(transport.stream);

        raw_tx
            .send(StreamResult::Message(pack(b"one", None).unwrap().into()))
            .await
            .unwrap();
        match stream.receive().await.unwrap() {
            StreamResult::Message(m) => assert_eq!(m, "one"),
            other => panic!("expected Message, got {other:?}"),
        }

        stream.receive_close();

        match stream.receive().await.unwrap() {
            StreamResult::Complete(c) => assert_eq!(c.code, Code::Canceled),
            other => panic!("expected Complete, got {other:?}"),
        }
        // Channel is closed; the completion is not observed twice.
        assert!(stream.receive().await.is_none());
        assert!(stream.is_closed());
        assert_eq!(aborts.load(Ordering::SeqCst), 1);

        // Bytes arriving after cancellation go nowhere.
        let _ = raw_tx
            .send(StreamResult::Message(pack(b"late", None).unwrap().into()))
            .await;
        assert!(stream.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_eof_without_completion_synthesizes_unknown() {
        let transport = test_transport();
        let raw_tx = transport.raw_tx;
        let mut stream = spawn_stream(transport.stream);

        raw_tx.send(StreamResult::Headers(Headers::new())).await.unwrap();
        drop(raw_tx);

        match stream.receive().await.unwrap() {
            StreamResult::Headers(_) => {}
            other => panic!("expected Headers, got {other:?}"),
        }
        match stream.receive().await.unwrap() {
            StreamResult::Complete(c) => {
                assert_eq!(c.code, Code::Unknown);
                assert!(c.error.unwrap().message().unwrap().contains("completion"));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decode_failure_terminates_with_internal() {
        let transport = test_transport();
        let raw_tx = transport.raw_tx.clone();
        let mut stream = spawn_stream(transport.stream);

        raw_tx
            .send(StreamResult::Message(
                pack(&[0xff, 0xfe], None).unwrap().into(),
            ))
            .await
            .unwrap();

        match stream.receive().await.unwrap() {
            StreamResult::Complete(c) => {
                assert_eq!(c.code, Code::Internal);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
        assert!(stream.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_messages_after_complete_dropped() {
        let transport = test_transport();
        let raw_tx = transport.raw_tx.clone();
        let mut stream = spawn_stream(transport.stream);

        // A completion and a message arrive in the same transport read
        // order; the message after the completion must not surface.
        raw_tx
            .send(StreamResult::Complete(Completion::ok(Headers::new())))
            .await
            .unwrap();
        let _ = raw_tx
            .send(StreamResult::Message(pack(b"late", None).unwrap().into()))
            .await;

        match stream.receive().await.unwrap() {
            StreamResult::Complete(c) => assert!(c.is_ok()),
            other => panic!("expected Complete, got {other:?}"),
        }
        assert!(stream.receive().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_emits_deadline_exceeded() {
        let transport = test_transport();
        let _raw_tx = transport.raw_tx.clone();
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(50);
        let mut stream = BidirectionalStream::spawn(
            transport.stream,
            unwrapping_functions(),
            Arc::new(TextCodec),
            Arc::new(TextCodec),
            Some(deadline),
        );

        match stream.receive().await.unwrap() {
            StreamResult::Complete(c) => assert_eq!(c.code, Code::DeadlineExceeded),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serialization_failure_leaves_stream_usable() {
        struct PickyCodec;
        impl Codec<String> for PickyCodec {
            fn encoding_name(&self) -> &'static str {
                "picky"
            }
            fn serialize(&self, message: &String) -> Result<Bytes, ConnectError> {
                if message == "bad" {
                    Err(ConnectError::serialization("refusing to encode"))
                } else {
                    Ok(Bytes::from(message.clone()))
                }
            }
            fn deserialize(&self, bytes: &Bytes) -> Result<String, ConnectError> {
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
        }

        let transport = test_transport();
        let stream = BidirectionalStream::spawn(
            transport.stream,
            unwrapping_functions(),
            Arc::new(PickyCodec),
            Arc::new(TextCodec),
            None,
        );

        let err = stream.send(&"bad".to_string()).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        // The failure did not close the stream.
        assert!(!stream.is_send_closed());
        stream.send(&"good".to_string()).await.unwrap();
    }
}
