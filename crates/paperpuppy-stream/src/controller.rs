use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::accumulator::ContentAccumulator;
use crate::config::StreamConfig;
use crate::credentials::{Anonymous, CredentialProvider};
use crate::decode::Utf8StreamDecoder;
use crate::errors::StreamError;
use crate::framer::ChunkFramer;
use crate::ids::{SessionId, StreamId};
use crate::payload::FormPayload;
use crate::publisher::{DebounceConfig, DebouncedPublisher, PublishSink};
use crate::state::StreamState;
use crate::store::{MessageStore, StreamPhase, StreamUpdate};
use crate::transport::{ByteStream, StreamRequest, Transport};

/// Why a running stream was told to stop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AbortSignal {
    #[default]
    None,
    /// [`StreamController::cancel`] was called.
    Cancelled,
    /// A newer `start` replaced the stream.
    Superseded,
}

/// Handle used to stop a running stream.
///
/// Cancellation is cooperative: the stream loop observes the signal at the
/// top of every iteration and while waiting for bytes.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<AbortSignal>,
}

impl AbortHandle {
    fn new() -> (Self, watch::Receiver<AbortSignal>) {
        let (tx, rx) = watch::channel(AbortSignal::None);
        (Self { tx }, rx)
    }

    /// Requests the stream to stop. The first signal wins.
    pub fn abort(&self, signal: AbortSignal) {
        self.tx.send_if_modified(|current| {
            if *current == AbortSignal::None && signal != AbortSignal::None {
                *current = signal;
                true
            } else {
                false
            }
        });
    }
}

type CompleteCallback = Box<dyn FnOnce(&str) + Send>;
type ErrorCallback = Box<dyn FnOnce(&StreamError) + Send>;

/// Per-call options for [`StreamController::start`].
#[derive(Default)]
pub struct StartOptions {
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
    debounce: Option<DebounceConfig>,
    debounce_base_delay: Option<Duration>,
    session_id: Option<SessionId>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once with the final content after a successful stream.
    pub fn on_complete(mut self, callback: impl FnOnce(&str) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Called once on open or read failure. Never called for cancellation.
    pub fn on_error(mut self, callback: impl FnOnce(&StreamError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Replaces the controller's debounce settings for this stream.
    pub fn debounce(mut self, debounce: DebounceConfig) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn debounce_base_delay(mut self, delay: Duration) -> Self {
        self.debounce_base_delay = Some(delay);
        self
    }

    /// Session the streamed message belongs to. Falls back to the
    /// controller's default session.
    pub fn session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

struct ActiveStream {
    id: StreamId,
    abort: AbortHandle,
}

struct Inner {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    store: Arc<dyn MessageStore>,
    config: StreamConfig,
    active: Mutex<Option<ActiveStream>>,
    default_session: Mutex<Option<SessionId>>,
    content: watch::Sender<String>,
    processing: watch::Sender<bool>,
    state: watch::Sender<StreamState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn transition(&self, next: StreamState) {
        let previous = self.state.send_replace(next);
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "unexpected stream state transition");
        }
    }

    /// Makes `id` the active stream, aborting whatever ran before.
    fn install(&self, id: StreamId, abort: AbortHandle) {
        let mut slot = lock(&self.active);
        if let Some(previous) = slot.replace(ActiveStream { id, abort }) {
            debug!(stream_id = %previous.id, superseded_by = %id, "superseding active stream");
            previous.abort.abort(AbortSignal::Superseded);
            self.transition(StreamState::Aborted);
            self.transition(StreamState::Idle);
        }
        self.content.send_replace(String::new());
        self.processing.send_replace(true);
        self.store.set_loading(true);
        self.transition(StreamState::Active);
    }

    /// Moves to `next` only while `id` still owns the slot.
    fn transition_for(&self, id: StreamId, next: StreamState) -> bool {
        let slot = lock(&self.active);
        if slot.as_ref().is_some_and(|active| active.id == id) {
            self.transition(next);
            true
        } else {
            false
        }
    }

    /// Releases the slot if `id` still owns it. Returns whether it did.
    fn release(&self, id: StreamId, terminal: StreamState) -> bool {
        let mut slot = lock(&self.active);
        if !slot.as_ref().is_some_and(|active| active.id == id) {
            return false;
        }
        slot.take();
        self.settle(terminal);
        true
    }

    fn settle(&self, terminal: StreamState) {
        self.processing.send_replace(false);
        self.store.set_loading(false);
        self.transition(terminal);
        self.transition(StreamState::Idle);
    }
}

/// Releases the slot when the `start` future is dropped mid-stream.
struct ReleaseGuard {
    inner: Arc<Inner>,
    stream_id: StreamId,
    armed: bool,
}

impl ReleaseGuard {
    /// Returns whether the stream still owned the slot.
    fn release(mut self, terminal: StreamState) -> bool {
        self.armed = false;
        self.inner.release(self.stream_id, terminal)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.armed && self.inner.release(self.stream_id, StreamState::Aborted) {
            debug!(stream_id = %self.stream_id, "stream dropped before finishing");
        }
    }
}

/// Publishes into the UI content and the store on behalf of one stream.
struct ControllerSink {
    inner: Arc<Inner>,
    stream_id: StreamId,
    session_id: Option<SessionId>,
}

impl PublishSink for ControllerSink {
    fn publish(&self, content: &str, phase: StreamPhase) -> bool {
        let slot = lock(&self.inner.active);
        let current = slot.as_ref().is_some_and(|active| active.id == self.stream_id);
        // Interrupted records are keyed by their own stream id, so a cancelled
        // stream may still persist what it received.
        if !current && phase != StreamPhase::Interrupted {
            debug!(stream_id = %self.stream_id, ?phase, "dropping publish from stale stream");
            return false;
        }
        if current {
            self.inner.content.send_replace(content.to_string());
        }
        if let Some(session_id) = &self.session_id {
            self.inner.store.update_stream_message(StreamUpdate {
                session_id: session_id.clone(),
                stream_id: self.stream_id,
                content: content.to_string(),
                phase,
            });
        }
        true
    }
}

enum Interrupt {
    Aborted(AbortSignal),
    Failed(StreamError),
}

/// Runs one streamed answer at a time.
///
/// Cloning is cheap; clones share the active stream, the observers and the
/// store. Starting a stream while another is running supersedes the older one.
#[derive(Clone)]
pub struct StreamController {
    inner: Arc<Inner>,
}

impl StreamController {
    pub fn builder() -> StreamControllerBuilder {
        StreamControllerBuilder::default()
    }

    /// Streams the answer for `payload` from `endpoint` and returns the final
    /// content.
    ///
    /// Returns [`StreamError::Cancelled`] when the stream is cancelled or
    /// superseded; callbacks are not invoked in that case.
    pub async fn start(
        &self,
        endpoint: impl Into<String>,
        payload: FormPayload,
        options: StartOptions,
    ) -> Result<String, StreamError> {
        let StartOptions {
            on_complete,
            on_error,
            debounce,
            debounce_base_delay,
            session_id,
        } = options;
        let session_id = session_id.or_else(|| self.default_session());
        let mut debounce = debounce.unwrap_or_else(|| self.inner.config.debounce.clone());
        if let Some(base_delay) = debounce_base_delay {
            debounce = debounce.with_base_delay(base_delay);
        }

        let stream_id = StreamId::new();
        let (abort, mut abort_rx) = AbortHandle::new();
        self.inner.install(stream_id, abort);
        let guard = ReleaseGuard {
            inner: Arc::clone(&self.inner),
            stream_id,
            armed: true,
        };
        info!(
            %stream_id,
            session_id = session_id.as_ref().map(SessionId::as_str).unwrap_or("-"),
            "stream started"
        );

        let mut publisher = DebouncedPublisher::new(
            debounce,
            ControllerSink {
                inner: Arc::clone(&self.inner),
                stream_id,
                session_id,
            },
        );
        let mut accumulator = ContentAccumulator::new(self.inner.config.sentinels.clone());

        let outcome = self
            .drive(endpoint.into(), payload, &mut abort_rx, &mut publisher, &mut accumulator)
            .await;

        match outcome {
            Ok(()) => {
                if !self.inner.transition_for(stream_id, StreamState::Completing) {
                    debug!(%stream_id, "stream replaced while finishing");
                    publisher.cancel_pending();
                    return Err(StreamError::Cancelled);
                }
                let content = accumulator.into_content();
                if !publisher.publish_now(&content, StreamPhase::Complete) {
                    debug!(%stream_id, "stream cancelled while finishing");
                    if !content.is_empty() {
                        publisher.publish_now(&content, StreamPhase::Interrupted);
                    }
                    return Err(StreamError::Cancelled);
                }
                if !guard.release(StreamState::Completed) {
                    debug!(%stream_id, "stream cancelled after its final publish");
                    return Err(StreamError::Cancelled);
                }
                if let Some(on_complete) = on_complete {
                    on_complete(&content);
                }
                info!(
                    %stream_id,
                    len = content.len(),
                    flushes = publisher.flush_count(),
                    "stream completed"
                );
                Ok(content)
            }
            Err(Interrupt::Failed(err)) => {
                warn!(
                    %stream_id,
                    error = %err,
                    partial_len = accumulator.content().len(),
                    "stream failed"
                );
                persist_partial(&mut publisher, &accumulator);
                if !guard.release(StreamState::Failed) {
                    debug!(%stream_id, "stream cancelled before its failure was reported");
                    return Err(StreamError::Cancelled);
                }
                if let Some(on_error) = on_error {
                    on_error(&err);
                }
                Err(err)
            }
            Err(Interrupt::Aborted(AbortSignal::Superseded)) => {
                debug!(%stream_id, "stream superseded");
                publisher.cancel_pending();
                Err(StreamError::Cancelled)
            }
            Err(Interrupt::Aborted(signal)) => {
                debug!(
                    %stream_id,
                    ?signal,
                    partial_len = accumulator.content().len(),
                    "stream cancelled"
                );
                persist_partial(&mut publisher, &accumulator);
                guard.release(StreamState::Aborted);
                Err(StreamError::Cancelled)
            }
        }
    }

    async fn drive(
        &self,
        endpoint: String,
        payload: FormPayload,
        abort_rx: &mut watch::Receiver<AbortSignal>,
        publisher: &mut DebouncedPublisher<ControllerSink>,
        accumulator: &mut ContentAccumulator,
    ) -> Result<(), Interrupt> {
        let config = &self.inner.config;
        let request = StreamRequest {
            endpoint,
            payload,
            bearer_token: self.inner.credentials.bearer_token(),
        };

        let mut body = tokio::select! {
            biased;
            signal = aborted(abort_rx) => return Err(Interrupt::Aborted(signal)),
            opened = open_stream(self.inner.transport.as_ref(), request, config.open_timeout) => {
                opened.map_err(Interrupt::Failed)?
            }
        };

        let mut decoder = Utf8StreamDecoder::default();
        let mut framer = ChunkFramer::default();
        loop {
            let signal = *abort_rx.borrow();
            if signal != AbortSignal::None {
                return Err(Interrupt::Aborted(signal));
            }

            tokio::select! {
                biased;
                signal = aborted(abort_rx) => return Err(Interrupt::Aborted(signal)),
                () = publisher.wait_due(), if publisher.has_pending() => {
                    publisher.flush();
                }
                next = next_chunk(&mut body, config.idle_timeout) => match next {
                    Ok(Some(bytes)) => {
                        let text = decoder.decode(&bytes);
                        if absorb(&mut framer, accumulator, &text) {
                            publisher.schedule(accumulator.content());
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        return Err(Interrupt::Failed(err.with_partial(accumulator.content())));
                    }
                }
            }
        }

        let tail = decoder.finish();
        absorb(&mut framer, accumulator, &tail);
        if let Some(event) = framer.finish() {
            accumulator.apply(&event);
        }
        Ok(())
    }

    /// Stops the active stream, if any. What it received so far is kept as an
    /// interrupted message.
    pub fn cancel(&self) {
        let mut slot = lock(&self.inner.active);
        let Some(active) = slot.take() else {
            return;
        };
        info!(stream_id = %active.id, "cancelling stream");
        active.abort.abort(AbortSignal::Cancelled);
        self.inner.settle(StreamState::Aborted);
    }

    /// Latest published content of the current (or last) stream.
    pub fn content(&self) -> String {
        self.inner.content.borrow().clone()
    }

    pub fn subscribe_content(&self) -> watch::Receiver<String> {
        self.inner.content.subscribe()
    }

    pub fn is_processing(&self) -> bool {
        *self.inner.processing.borrow()
    }

    pub fn subscribe_processing(&self) -> watch::Receiver<bool> {
        self.inner.processing.subscribe()
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.inner.state.subscribe()
    }

    pub fn active_stream_id(&self) -> Option<StreamId> {
        lock(&self.inner.active).as_ref().map(|active| active.id)
    }

    pub fn default_session(&self) -> Option<SessionId> {
        lock(&self.inner.default_session).clone()
    }

    /// Session used when [`StartOptions`] does not name one.
    pub fn set_default_session(&self, session_id: Option<SessionId>) {
        *lock(&self.inner.default_session) = session_id;
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&self.inner.store)
    }
}

/// Builder for [`StreamController`].
#[derive(Default)]
pub struct StreamControllerBuilder {
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    store: Option<Arc<dyn MessageStore>>,
    config: StreamConfig,
    default_session: Option<SessionId>,
}

impl StreamControllerBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to [`Anonymous`].
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.default_session = Some(session_id.into());
        self
    }

    pub fn build(self) -> Result<StreamController, StreamError> {
        let transport = self
            .transport
            .ok_or_else(|| StreamError::Config("a transport is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| StreamError::Config("a message store is required".into()))?;
        self.config.validate()?;

        let (content, _) = watch::channel(String::new());
        let (processing, _) = watch::channel(false);
        let (state, _) = watch::channel(StreamState::Idle);
        Ok(StreamController {
            inner: Arc::new(Inner {
                transport,
                credentials: self.credentials.unwrap_or_else(|| Arc::new(Anonymous)),
                store,
                config: self.config,
                active: Mutex::new(None),
                default_session: Mutex::new(self.default_session),
                content,
                processing,
                state,
            }),
        })
    }
}

fn persist_partial(
    publisher: &mut DebouncedPublisher<ControllerSink>,
    accumulator: &ContentAccumulator,
) {
    if accumulator.is_empty() {
        publisher.cancel_pending();
    } else {
        publisher.publish_now(accumulator.content(), StreamPhase::Interrupted);
    }
}

/// Feeds decoded text through the framer; returns whether content grew.
fn absorb(framer: &mut ChunkFramer, accumulator: &mut ContentAccumulator, text: &str) -> bool {
    let mut grew = false;
    for event in framer.feed(text) {
        grew |= !accumulator.apply(&event).is_empty();
    }
    grew
}

async fn aborted(rx: &mut watch::Receiver<AbortSignal>) -> AbortSignal {
    loop {
        let signal = *rx.borrow_and_update();
        if signal != AbortSignal::None {
            return signal;
        }
        if rx.changed().await.is_err() {
            let signal = *rx.borrow();
            if signal != AbortSignal::None {
                return signal;
            }
            // Sender gone without a signal: the stream can no longer be aborted.
            return std::future::pending().await;
        }
    }
}

async fn open_stream(
    transport: &dyn Transport,
    request: StreamRequest,
    limit: Option<Duration>,
) -> Result<ByteStream, StreamError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, transport.open(request))
            .await
            .map_err(|_| StreamError::OpenTimeout(limit))?,
        None => transport.open(request).await,
    }
}

async fn next_chunk(
    body: &mut ByteStream,
    idle: Option<Duration>,
) -> Result<Option<bytes::Bytes>, StreamError> {
    let next = match idle {
        Some(after) => tokio::time::timeout(after, body.next())
            .await
            .map_err(|_| StreamError::IdleTimeout {
                after,
                partial: String::new(),
            })?,
        None => body.next().await,
    };
    next.transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use std::collections::VecDeque;
    use std::sync::OnceLock;
    use std::task::Poll;

    enum Script {
        Chunks(Vec<Result<Bytes, StreamError>>),
        ThenPending(Vec<Result<Bytes, StreamError>>),
        Paced(Vec<&'static str>, Duration),
        Fail(StreamError),
        Hang,
    }

    struct FakeTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<StreamRequest>>,
    }

    impl FakeTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().expect("lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn open(&self, request: StreamRequest) -> Result<ByteStream, StreamError> {
            self.requests.lock().expect("lock").push(request);
            let script = self
                .scripts
                .lock()
                .expect("lock")
                .pop_front()
                .expect("unexpected open");
            match script {
                Script::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks))),
                Script::ThenPending(chunks) => {
                    Ok(Box::pin(stream::iter(chunks).chain(stream::pending())))
                }
                Script::Paced(frames, every) => Ok(Box::pin(stream::iter(frames).then(
                    move |frame| async move {
                        tokio::time::sleep(every).await;
                        Ok::<_, StreamError>(Bytes::from_static(frame.as_bytes()))
                    },
                ))),
                Script::Fail(err) => Err(err),
                Script::Hang => std::future::pending().await,
            }
        }
    }

    #[derive(Clone, Copy)]
    enum CancelPoint {
        Open,
        Read,
        End,
    }

    /// Cancels its own controller at `point`, in the same poll that then
    /// fails or ends the stream.
    struct CancellingTransport {
        controller: OnceLock<StreamController>,
        point: CancelPoint,
    }

    #[async_trait::async_trait]
    impl Transport for CancellingTransport {
        async fn open(&self, _request: StreamRequest) -> Result<ByteStream, StreamError> {
            let controller = self.controller.get().cloned().expect("controller wired");
            let head = stream::iter(vec![chunk("data:'late'\n\n")]);
            match self.point {
                CancelPoint::Open => {
                    controller.cancel();
                    Err(StreamError::TransportOpen {
                        message: "refused".into(),
                    })
                }
                CancelPoint::Read => Ok(Box::pin(head.chain(stream::once(async move {
                    controller.cancel();
                    Err(StreamError::read("connection reset", ""))
                })))),
                CancelPoint::End => Ok(Box::pin(head.chain(stream::poll_fn(move |_| {
                    controller.cancel();
                    Poll::Ready(None::<Result<Bytes, StreamError>>)
                })))),
            }
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        updates: Mutex<Vec<StreamUpdate>>,
    }

    impl MessageStore for RecordingStore {
        fn update_stream_message(&self, update: StreamUpdate) {
            self.updates.lock().expect("lock").push(update);
        }

        fn set_loading(&self, _loading: bool) {}
    }

    struct RotatingToken(Mutex<Option<String>>);

    impl CredentialProvider for RotatingToken {
        fn bearer_token(&self) -> Option<String> {
            self.0.lock().expect("lock").clone()
        }
    }

    #[derive(Clone, Default)]
    struct Calls {
        completed: Arc<Mutex<Vec<String>>>,
        errors: Arc<Mutex<Vec<StreamError>>>,
    }

    impl Calls {
        fn options(&self) -> StartOptions {
            let completed = Arc::clone(&self.completed);
            let errors = Arc::clone(&self.errors);
            StartOptions::new()
                .on_complete(move |content| {
                    completed.lock().expect("lock").push(content.to_string())
                })
                .on_error(move |err| errors.lock().expect("lock").push(err.clone()))
        }

        fn completed(&self) -> Vec<String> {
            self.completed.lock().expect("lock").clone()
        }

        fn errors(&self) -> Vec<StreamError> {
            self.errors.lock().expect("lock").clone()
        }
    }

    fn chunk(text: &'static str) -> Result<Bytes, StreamError> {
        Ok(Bytes::from_static(text.as_bytes()))
    }

    fn session() -> SessionId {
        SessionId::from("1")
    }

    fn controller(
        transport: Arc<FakeTransport>,
        store: Arc<InMemoryMessageStore>,
        config: StreamConfig,
    ) -> StreamController {
        StreamController::builder()
            .transport(transport)
            .store(store)
            .config(config)
            .default_session(session())
            .build()
            .expect("controller")
    }

    #[tokio::test]
    async fn streams_hello_world_to_completion() {
        let transport = FakeTransport::new(vec![Script::Chunks(vec![
            chunk("data:'Hello'\n\n"),
            chunk("data: World\n\n"),
        ])]);
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = controller(transport, Arc::clone(&store), StreamConfig::default());
        let calls = Calls::default();

        let content = controller
            .start("http://test/send", FormPayload::new(), calls.options())
            .await
            .expect("stream");

        assert_eq!(content, "HelloWorld");
        assert_eq!(controller.content(), "HelloWorld");
        assert_eq!(calls.completed(), vec!["HelloWorld"]);
        assert!(calls.errors().is_empty());

        let messages = store.messages(&session());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "HelloWorld");
        assert!(messages[0].is_complete);
        assert_eq!(store.loading_history(), vec![true, false]);
        assert_eq!(controller.state(), StreamState::Idle);
        assert!(!controller.is_processing());
        assert_eq!(controller.active_stream_id(), None);
    }

    #[tokio::test]
    async fn escaped_newline_and_split_frames_are_reassembled() {
        let transport = FakeTransport::new(vec![Script::Chunks(vec![
            chunk("data:'Line1\\nLi"),
            chunk("ne2'\n"),
            chunk("\ndata:\"Connection closed\"\n\n"),
        ])]);
        let controller = controller(
            transport,
            Arc::new(InMemoryMessageStore::new()),
            StreamConfig::default(),
        );

        let content = controller
            .start("http://test/send", FormPayload::new(), StartOptions::new())
            .await
            .expect("stream");
        assert_eq!(content, "Line1\nLine2");
    }

    #[tokio::test]
    async fn trailing_event_without_separator_is_kept() {
        let transport = FakeTransport::new(vec![Script::Chunks(vec![
            chunk("data:'a'\n\n"),
            chunk("data:'b'"),
        ])]);
        let controller = controller(
            transport,
            Arc::new(InMemoryMessageStore::new()),
            StreamConfig::default(),
        );

        let content = controller
            .start("http://test/send", FormPayload::new(), StartOptions::new())
            .await
            .expect("stream");
        assert_eq!(content, "ab");
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_supersedes_first_without_stale_writes() {
        let transport = FakeTransport::new(vec![
            Script::ThenPending(vec![chunk("data:'old'\n\n")]),
            Script::Chunks(vec![chunk("data:'new'\n\n")]),
        ]);
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = controller(transport, Arc::clone(&store), StreamConfig::default());

        let first_calls = Calls::default();
        let first = tokio::spawn({
            let controller = controller.clone();
            let options = first_calls.options();
            async move {
                controller
                    .start("http://test/first", FormPayload::new(), options)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let first_id = controller.active_stream_id().expect("first stream active");
        assert_eq!(controller.content(), "old");

        let second_calls = Calls::default();
        let second = controller
            .start("http://test/second", FormPayload::new(), second_calls.options())
            .await;
        assert_eq!(second.as_deref(), Ok("new"));
        assert_eq!(first.await.expect("join"), Err(StreamError::Cancelled));

        assert!(first_calls.completed().is_empty());
        assert!(first_calls.errors().is_empty());
        assert_eq!(second_calls.completed(), vec!["new"]);

        let old = store.stream_message(&session(), first_id).expect("old message");
        assert_eq!(old.content, "old");
        assert!(old.interrupted);
        assert!(!old.is_draft);
        let messages = store.messages(&session());
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.content == "new" && m.is_complete));

        assert_eq!(controller.content(), "new");
        assert_eq!(controller.state(), StreamState::Idle);
        assert_eq!(store.loading_history(), vec![true, true, false]);
        assert!(!store.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn superseding_drops_a_pending_flush_of_the_old_stream() {
        let transport = FakeTransport::new(vec![
            Script::ThenPending(vec![chunk("data:'old'\n\n")]),
            Script::Chunks(vec![chunk("data:'new'\n\n")]),
        ]);
        let store = Arc::new(RecordingStore::default());
        let controller = StreamController::builder()
            .transport(transport)
            .store(Arc::clone(&store) as Arc<dyn MessageStore>)
            .default_session("1")
            .build()
            .expect("controller");

        let first = tokio::spawn({
            let controller = controller.clone();
            async move {
                controller
                    .start("http://test/first", FormPayload::new(), StartOptions::new())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.active_stream_id().is_some());
        assert_eq!(controller.content(), "");

        let second = controller
            .start("http://test/second", FormPayload::new(), StartOptions::new())
            .await;
        assert_eq!(second.as_deref(), Ok("new"));
        assert_eq!(first.await.expect("join"), Err(StreamError::Cancelled));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let updates = store.updates.lock().expect("lock").clone();
        assert_eq!(updates.len(), 1, "unexpected writes: {updates:?}");
        assert_eq!(updates[0].content, "new");
        assert!(updates[0].is_complete());
        assert_eq!(controller.content(), "new");
    }

    async fn cancel_racing_with(
        point: CancelPoint,
    ) -> (Result<String, StreamError>, Calls, Arc<InMemoryMessageStore>) {
        let transport = Arc::new(CancellingTransport {
            controller: OnceLock::new(),
            point,
        });
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = StreamController::builder()
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .store(Arc::clone(&store) as Arc<dyn MessageStore>)
            .default_session(session())
            .build()
            .expect("controller");
        assert!(transport.controller.set(controller.clone()).is_ok());

        let calls = Calls::default();
        let result = controller
            .start("http://test/send", FormPayload::new(), calls.options())
            .await;
        assert_eq!(controller.state(), StreamState::Idle);
        assert!(!controller.is_processing());
        (result, calls, store)
    }

    #[tokio::test]
    async fn cancel_during_failed_open_is_not_reported_as_error() {
        let (result, calls, store) = cancel_racing_with(CancelPoint::Open).await;
        assert_eq!(result, Err(StreamError::Cancelled));
        assert!(calls.errors().is_empty());
        assert!(calls.completed().is_empty());
        assert!(store.messages(&session()).is_empty());
        assert_eq!(store.loading_history(), vec![true, false]);
    }

    #[tokio::test]
    async fn cancel_during_failed_read_keeps_partial_without_error() {
        let (result, calls, store) = cancel_racing_with(CancelPoint::Read).await;
        assert_eq!(result, Err(StreamError::Cancelled));
        assert!(calls.errors().is_empty());
        let messages = store.messages(&session());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "late");
        assert!(messages[0].interrupted);
    }

    #[tokio::test]
    async fn cancel_at_end_of_body_skips_completion() {
        let (result, calls, store) = cancel_racing_with(CancelPoint::End).await;
        assert_eq!(result, Err(StreamError::Cancelled));
        assert!(calls.completed().is_empty());
        assert!(calls.errors().is_empty());
        assert!(store.messages(&session()).iter().all(|m| !m.is_complete));
    }

    #[tokio::test]
    async fn read_error_persists_partial_and_reports_once() {
        let transport = FakeTransport::new(vec![Script::Chunks(vec![
            chunk("data:'part'\n\n"),
            Err(StreamError::read("connection reset", "")),
        ])]);
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = controller(transport, Arc::clone(&store), StreamConfig::default());
        let calls = Calls::default();

        let err = controller
            .start("http://test/send", FormPayload::new(), calls.options())
            .await
            .expect_err("read error");

        assert_eq!(err.partial_content(), Some("part"));
        assert_eq!(calls.errors(), vec![err]);
        assert!(calls.completed().is_empty());

        let messages = store.messages(&session());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "part");
        assert!(messages[0].interrupted);
        assert!(!messages[0].is_complete);
        assert_eq!(store.loading_history(), vec![true, false]);
        assert_eq!(controller.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn http_error_fails_before_any_content() {
        let transport = FakeTransport::new(vec![Script::Fail(StreamError::Http {
            status: 503,
            body: None,
        })]);
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = controller(transport, Arc::clone(&store), StreamConfig::default());
        let calls = Calls::default();

        let err = controller
            .start("http://test/send", FormPayload::new(), calls.options())
            .await
            .expect_err("http error");

        assert_eq!(err.status(), Some(503));
        assert_eq!(calls.errors().len(), 1);
        assert!(store.messages(&session()).is_empty());
        assert_eq!(store.loading_history(), vec![true, false]);
        assert!(!controller.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_partial_and_skips_callbacks() {
        let transport =
            FakeTransport::new(vec![Script::ThenPending(vec![chunk("data:'partial'\n\n")])]);
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = controller(transport, Arc::clone(&store), StreamConfig::default());
        let calls = Calls::default();

        let handle = tokio::spawn({
            let controller = controller.clone();
            let options = calls.options();
            async move {
                controller
                    .start("http://test/send", FormPayload::new(), options)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.is_processing());

        controller.cancel();
        assert!(!controller.is_processing());
        assert_eq!(controller.state(), StreamState::Idle);
        assert_eq!(handle.await.expect("join"), Err(StreamError::Cancelled));

        assert!(calls.completed().is_empty());
        assert!(calls.errors().is_empty());
        let messages = store.messages(&session());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "partial");
        assert!(messages[0].interrupted);
        assert_eq!(store.loading_history(), vec![true, false]);
    }

    #[tokio::test]
    async fn cancel_without_active_stream_is_a_no_op() {
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = controller(
            FakeTransport::new(vec![]),
            Arc::clone(&store),
            StreamConfig::default(),
        );
        controller.cancel();
        assert!(store.loading_history().is_empty());
        assert_eq!(controller.state(), StreamState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_start_future_releases_the_stream() {
        let transport = FakeTransport::new(vec![Script::ThenPending(vec![])]);
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = controller(transport, Arc::clone(&store), StreamConfig::default());

        let handle = tokio::spawn({
            let controller = controller.clone();
            async move {
                controller
                    .start("http://test/send", FormPayload::new(), StartOptions::new())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.active_stream_id().is_some());

        handle.abort();
        assert!(handle.await.expect_err("aborted").is_cancelled());

        assert_eq!(controller.active_stream_id(), None);
        assert!(!controller.is_processing());
        assert_eq!(controller.state(), StreamState::Idle);
        assert_eq!(store.loading_history(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out_with_partial_content() {
        let transport = FakeTransport::new(vec![Script::ThenPending(vec![chunk("data:'x'\n\n")])]);
        let store = Arc::new(InMemoryMessageStore::new());
        let config = StreamConfig::default().idle_timeout(Some(Duration::from_secs(5)));
        let controller = controller(transport, Arc::clone(&store), config);

        let err = controller
            .start("http://test/send", FormPayload::new(), StartOptions::new())
            .await
            .expect_err("idle timeout");

        assert_eq!(
            err,
            StreamError::IdleTimeout {
                after: Duration::from_secs(5),
                partial: "x".into()
            }
        );
        assert!(store.messages(&session())[0].interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_bounded_by_open_timeout() {
        let transport = FakeTransport::new(vec![Script::Hang]);
        let config = StreamConfig::default().open_timeout(Some(Duration::from_secs(1)));
        let controller = controller(transport, Arc::new(InMemoryMessageStore::new()), config);

        let err = controller
            .start("http://test/send", FormPayload::new(), StartOptions::new())
            .await
            .expect_err("open timeout");
        assert_eq!(err, StreamError::OpenTimeout(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn published_content_only_grows() {
        let transport = FakeTransport::new(vec![Script::Paced(
            vec!["data:'a'\n\n", "data:'b'\n\n", "data:'c'\n\n", "data:'d'\n\n"],
            Duration::from_millis(150),
        )]);
        let store = Arc::new(RecordingStore::default());
        let controller = StreamController::builder()
            .transport(transport)
            .store(Arc::clone(&store) as Arc<dyn MessageStore>)
            .default_session("1")
            .build()
            .expect("controller");

        let content = controller
            .start("http://test/send", FormPayload::new(), StartOptions::new())
            .await
            .expect("stream");
        assert_eq!(content, "abcd");

        let updates = store.updates.lock().expect("lock").clone();
        assert!(updates.len() >= 2, "expected intermediate flushes: {updates:?}");
        for pair in updates.windows(2) {
            assert!(pair[1].content.starts_with(&pair[0].content));
        }
        let last = updates.last().expect("final update");
        assert_eq!(last.content, "abcd");
        assert!(last.is_complete());
        assert!(updates[..updates.len() - 1].iter().all(|u| u.phase == StreamPhase::Streaming));
    }

    #[tokio::test]
    async fn token_is_read_for_every_request() {
        let transport = FakeTransport::new(vec![Script::Chunks(vec![]), Script::Chunks(vec![])]);
        let token = Arc::new(RotatingToken(Mutex::new(None)));
        let controller = StreamController::builder()
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .credentials(Arc::clone(&token) as Arc<dyn CredentialProvider>)
            .store(Arc::new(InMemoryMessageStore::new()))
            .build()
            .expect("controller");

        let payload = FormPayload::new().append("message", "hi");
        controller
            .start("http://test/a", payload.clone(), StartOptions::new())
            .await
            .expect("first");
        *token.0.lock().expect("lock") = Some("rotated".into());
        controller
            .start("http://test/b", payload.clone(), StartOptions::new())
            .await
            .expect("second");

        let requests = transport.requests();
        assert_eq!(requests[0].bearer_token, None);
        assert_eq!(requests[1].bearer_token.as_deref(), Some("rotated"));
        assert_eq!(requests[1].endpoint, "http://test/b");
        assert_eq!(requests[1].payload, payload);
    }

    #[tokio::test]
    async fn explicit_session_overrides_default() {
        let transport = FakeTransport::new(vec![Script::Chunks(vec![chunk("data:'x'\n\n")])]);
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = controller(transport, Arc::clone(&store), StreamConfig::default());

        controller
            .start(
                "http://test/send",
                FormPayload::new(),
                StartOptions::new().session_id(9_u64),
            )
            .await
            .expect("stream");

        assert!(store.messages(&session()).is_empty());
        assert_eq!(store.messages(&SessionId::from(9_u64)).len(), 1);
    }

    #[tokio::test]
    async fn streams_over_http_with_bearer_token() {
        use crate::config::ClientConfig;
        use crate::credentials::StaticToken;
        use crate::payload::ChatRequest;
        use crate::transport::HttpTransport;
        use wiremock::matchers::{body_string_contains, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/5/sendRPC"))
            .and(header("authorization", "Bearer secret"))
            .and(body_string_contains("enableDeepThought=true"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data:'The answer is \\(x^2\\)'\n\ndata:\"Connection closed\"\n\n",
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = ClientConfig::new(format!("{}/api", server.uri()));
        let store = Arc::new(InMemoryMessageStore::new());
        let controller = StreamController::builder()
            .transport(Arc::new(HttpTransport::new(&client).expect("transport")))
            .credentials(Arc::new(StaticToken::new("secret")))
            .store(Arc::clone(&store) as Arc<dyn MessageStore>)
            .default_session(5_u64)
            .build()
            .expect("controller");

        let answer = controller
            .start(
                client.send_url(&SessionId::from(5_u64)),
                ChatRequest::new("square?").deep_thought(true).into_payload(),
                StartOptions::new(),
            )
            .await
            .expect("stream");

        assert_eq!(answer, "The answer is $x^2$");
        let messages = store.messages(&SessionId::from(5_u64));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_complete);
    }

    #[test]
    fn builder_requires_transport_and_store() {
        let missing_transport = StreamController::builder()
            .store(Arc::new(InMemoryMessageStore::new()))
            .build();
        assert!(matches!(missing_transport, Err(StreamError::Config(_))));

        let missing_store = StreamController::builder()
            .transport(FakeTransport::new(vec![]))
            .build();
        assert!(matches!(missing_store, Err(StreamError::Config(_))));
    }

    #[test]
    fn first_abort_signal_wins() {
        let (handle, rx) = AbortHandle::new();
        handle.abort(AbortSignal::Cancelled);
        handle.abort(AbortSignal::Superseded);
        assert_eq!(*rx.borrow(), AbortSignal::Cancelled);
    }
}
