//! Chat session controller.
//!
//! A [`Session`] owns the transcript and the engine handle. Engine work runs
//! in spawned tasks that report back as [`SessionEvent`]s; the event loop
//! feeds those into [`Session::apply`], so only one place ever mutates the
//! session.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{ChatCompletion, ChatEngine, EngineLoader, InitProgress};
use crate::state::Transcript;

/// Assistant content used when the engine answers without any text
pub const NO_REPLY: &str = "(No reply)";

/// How long the "connected" notice stays up
pub const NOTICE_DURATION: Duration = Duration::from_millis(2500);

const CONNECTING_TEXT: &str = "Connecting to engine...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Engine is loading; carries the latest progress text
    Initializing(String),
    /// Engine handle present and no turn in flight
    Ready,
    /// A completion request is in flight
    Busy,
    /// Engine creation failed or timed out; [`Session::retry`] starts over
    Failed(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("Model not ready yet!")]
    NotReady,
    #[error("Still waiting for the previous reply")]
    Busy,
}

/// Transient message that clears itself after a deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub text: String,
    pub expires_at: Instant,
}

/// Results of background engine work, delivered to the event loop
pub enum SessionEvent {
    Progress(InitProgress),
    Ready(Arc<dyn ChatEngine>),
    InitFailed(String),
    Reply(Result<ChatCompletion>),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Progress(p) => f.debug_tuple("Progress").field(p).finish(),
            SessionEvent::Ready(_) => f.write_str("Ready(..)"),
            SessionEvent::InitFailed(reason) => f.debug_tuple("InitFailed").field(reason).finish(),
            SessionEvent::Reply(result) => f.debug_tuple("Reply").field(result).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub system_prompt: String,
    /// Give up on engine creation after this long. `None` waits forever.
    pub init_timeout: Option<Duration>,
}

pub struct Session {
    model: String,
    init_timeout: Option<Duration>,
    loader: Arc<dyn EngineLoader>,
    engine: Option<Arc<dyn ChatEngine>>,

    transcript: Transcript,
    status: SessionStatus,
    init_fraction: Option<f64>,
    notice: Option<Notice>,
    last_error: Option<String>,

    events_tx: UnboundedSender<SessionEvent>,
    init_task: Option<JoinHandle<()>>,
    turn_task: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a session. The returned receiver must be drained into
    /// [`Session::apply`] by the owner's event loop.
    pub fn new(
        config: SessionConfig,
        loader: Arc<dyn EngineLoader>,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            model: config.model,
            init_timeout: config.init_timeout,
            loader,
            engine: None,
            transcript: Transcript::new(config.system_prompt),
            status: SessionStatus::Initializing(CONNECTING_TEXT.to_string()),
            init_fraction: None,
            notice: None,
            last_error: None,
            events_tx,
            init_task: None,
            turn_task: None,
        };
        (session, events_rx)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    /// Error from the most recent failed turn, cleared by the next send
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn init_fraction(&self) -> Option<f64> {
        self.init_fraction
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.status == SessionStatus::Ready
    }

    pub fn is_busy(&self) -> bool {
        self.status == SessionStatus::Busy
    }

    /// Start loading the engine in the background.
    ///
    /// Does nothing once an engine is present or while a load is running.
    pub fn initialize(&mut self) {
        if self.engine.is_some() {
            return;
        }
        if self.init_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        info!(model = %self.model, "initializing engine");
        self.status = SessionStatus::Initializing(CONNECTING_TEXT.to_string());
        self.init_fraction = None;

        let loader = self.loader.clone();
        let model = self.model.clone();
        let timeout = self.init_timeout;
        let events = self.events_tx.clone();

        self.init_task = Some(tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let load = loader.load(&model, progress_tx);
            tokio::pin!(load);

            let deadline = async move {
                match timeout {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(deadline);

            let outcome = loop {
                tokio::select! {
                    biased;
                    Some(progress) = progress_rx.recv() => {
                        let _ = events.send(SessionEvent::Progress(progress));
                    }
                    result = &mut load => break result.map_err(|e| format!("{e:#}")),
                    _ = &mut deadline => {
                        break Err("timed out waiting for the model to load".to_string());
                    }
                }
            };

            // Progress sent right before completion must not overtake the result
            while let Ok(progress) = progress_rx.try_recv() {
                let _ = events.send(SessionEvent::Progress(progress));
            }

            let event = match outcome {
                Ok(engine) => SessionEvent::Ready(engine),
                Err(reason) => SessionEvent::InitFailed(reason),
            };
            let _ = events.send(event);
        }));
    }

    /// Restart initialization after a failure. Returns whether a retry started.
    pub fn retry(&mut self) -> bool {
        if !matches!(self.status, SessionStatus::Failed(_)) {
            return false;
        }
        info!(model = %self.model, "retrying engine initialization");
        self.initialize();
        true
    }

    /// Append `text` as a user message and ask the engine for a reply.
    ///
    /// Rejected without touching the transcript when the engine is not
    /// loaded yet or a previous turn is still in flight.
    pub fn send_message(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        let Some(engine) = self.engine.clone() else {
            warn!("send rejected: engine not ready");
            return Err(SessionError::NotReady);
        };
        if self.status == SessionStatus::Busy {
            warn!("send rejected: turn in flight");
            return Err(SessionError::Busy);
        }

        self.transcript.push_user(text);
        self.status = SessionStatus::Busy;
        self.last_error = None;

        let messages = self.transcript.messages().to_vec();
        let events = self.events_tx.clone();
        debug!(messages = messages.len(), "starting turn");

        self.turn_task = Some(tokio::spawn(async move {
            let result = engine.complete_chat(&messages).await;
            let _ = events.send(SessionEvent::Reply(result));
        }));
        Ok(())
    }

    /// Fold a background result into the session state
    pub fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Progress(progress) => {
                if let SessionStatus::Initializing(_) = self.status {
                    let text = progress.display_text();
                    debug!(%text, fraction = ?progress.fraction, "init progress");
                    self.status = SessionStatus::Initializing(text);
                    if progress.fraction.is_some() {
                        self.init_fraction = progress.fraction;
                    }
                }
            }
            SessionEvent::Ready(engine) => {
                self.init_task = None;
                if self.engine.is_some() {
                    return;
                }
                info!(model = %self.model, "engine ready");
                self.engine = Some(engine);
                self.status = SessionStatus::Ready;
                self.init_fraction = None;
                self.notify(format!("Connected to {}", self.model));
            }
            SessionEvent::InitFailed(reason) => {
                self.init_task = None;
                if self.engine.is_some() {
                    return;
                }
                error!(model = %self.model, %reason, "engine initialization failed");
                self.status = SessionStatus::Failed(reason);
            }
            SessionEvent::Reply(result) => {
                self.turn_task = None;
                match result {
                    Ok(completion) => {
                        let content = completion.first_content().unwrap_or(NO_REPLY);
                        self.transcript.push_assistant(content);
                        debug!(chars = content.len(), "turn complete");
                    }
                    Err(e) => {
                        let message = format!("{e:#}");
                        error!(error = %message, "error while chatting");
                        self.last_error = Some(message);
                    }
                }
                self.status = SessionStatus::Ready;
            }
        }
    }

    /// Show a transient notice for [`NOTICE_DURATION`]
    pub fn notify(&mut self, text: impl Into<String>) {
        self.notice = Some(Notice {
            text: text.into(),
            expires_at: Instant::now() + NOTICE_DURATION,
        });
    }

    /// Drop the notice once its deadline has passed
    pub fn clear_expired_notice(&mut self, now: Instant) {
        if self.notice.as_ref().is_some_and(|n| now >= n.expires_at) {
            self.notice = None;
        }
    }

    /// Stop background work and release the engine, if one was loaded
    pub async fn dispose(&mut self) {
        if let Some(task) = self.init_task.take() {
            task.abort();
        }
        if let Some(task) = self.turn_task.take() {
            task.abort();
        }
        if let Some(engine) = self.engine.take() {
            info!(model = %self.model, "disposing engine");
            engine.dispose().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::{ChatMessage, ChatRole};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) const SYSTEM: &str = "You are a helpful assistant that can help me with my tasks";

    pub(crate) enum Scripted {
        Reply(ChatCompletion),
        Fail(&'static str),
    }

    #[derive(Default)]
    pub(crate) struct ScriptedEngine {
        replies: Mutex<VecDeque<Scripted>>,
        pub seen: Mutex<Vec<Vec<ChatMessage>>>,
        pub disposed: AtomicBool,
    }

    impl ScriptedEngine {
        pub fn with(replies: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl ChatEngine for ScriptedEngine {
        async fn complete_chat(&self, messages: &[ChatMessage]) -> Result<ChatCompletion> {
            self.seen.lock().unwrap().push(messages.to_vec());
            match self.replies.lock().unwrap().pop_front() {
                Some(Scripted::Reply(c)) => Ok(c),
                Some(Scripted::Fail(msg)) => bail!("{msg}"),
                None => bail!("no scripted reply"),
            }
        }

        async fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct ScriptedLoader {
        pub engine: Arc<ScriptedEngine>,
        pub progress: Vec<InitProgress>,
        pub failures: AtomicUsize,
        pub stall: bool,
        pub loads: AtomicUsize,
    }

    impl ScriptedLoader {
        pub fn new(engine: Arc<ScriptedEngine>) -> Self {
            Self {
                engine,
                progress: Vec::new(),
                failures: AtomicUsize::new(0),
                stall: false,
                loads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EngineLoader for ScriptedLoader {
        async fn load(
            &self,
            _model: &str,
            progress: UnboundedSender<InitProgress>,
        ) -> Result<Arc<dyn ChatEngine>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            for p in &self.progress {
                let _ = progress.send(p.clone());
            }
            if self.stall {
                std::future::pending::<()>().await;
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                bail!("model not found");
            }
            Ok(self.engine.clone() as Arc<dyn ChatEngine>)
        }
    }

    pub(crate) fn config() -> SessionConfig {
        SessionConfig {
            model: "test-model".to_string(),
            system_prompt: SYSTEM.to_string(),
            init_timeout: None,
        }
    }

    /// Apply events until the session leaves the given predicate
    pub(crate) async fn pump_while(
        session: &mut Session,
        rx: &mut UnboundedReceiver<SessionEvent>,
        mut pending: impl FnMut(&SessionStatus) -> bool,
    ) {
        while pending(session.status()) {
            let event = rx.recv().await.expect("event channel closed");
            session.apply(event);
        }
    }

    pub(crate) async fn ready_session(
        replies: Vec<Scripted>,
    ) -> (Session, UnboundedReceiver<SessionEvent>, Arc<ScriptedEngine>) {
        let engine = ScriptedEngine::with(replies);
        let loader = Arc::new(ScriptedLoader::new(engine.clone()));
        let (mut session, mut rx) = Session::new(config(), loader);
        session.initialize();
        pump_while(&mut session, &mut rx, |s| matches!(s, SessionStatus::Initializing(_))).await;
        assert_eq!(session.status(), &SessionStatus::Ready);
        (session, rx, engine)
    }

    fn contents(session: &Session) -> Vec<(ChatRole, String)> {
        session
            .transcript()
            .messages()
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_ready_reached_exactly_once_after_progress() {
        let engine = ScriptedEngine::with(vec![]);
        let mut loader = ScriptedLoader::new(engine);
        loader.progress = vec![
            InitProgress::text("pulling manifest"),
            InitProgress::default(),
            InitProgress { text: Some("downloading".into()), fraction: Some(0.5) },
        ];
        let (mut session, mut rx) = Session::new(config(), Arc::new(loader));
        session.initialize();

        let mut ready_transitions = 0;
        let mut seen_texts = Vec::new();
        while !session.is_ready() {
            let before = session.status().clone();
            session.apply(rx.recv().await.unwrap());
            if let SessionStatus::Initializing(text) = session.status() {
                seen_texts.push(text.clone());
            }
            if before != SessionStatus::Ready && session.is_ready() {
                ready_transitions += 1;
            }
        }
        assert_eq!(ready_transitions, 1);
        assert_eq!(seen_texts, vec!["pulling manifest", "Downloading model...", "downloading"]);

        // Late init events do not disturb a ready session
        session.apply(SessionEvent::Progress(InitProgress::text("late")));
        session.apply(SessionEvent::Ready(ScriptedEngine::with(vec![])));
        session.apply(SessionEvent::InitFailed("late failure".into()));
        assert_eq!(session.status(), &SessionStatus::Ready);
        assert!(session.notice().is_some());
    }

    #[tokio::test]
    async fn test_send_without_engine_leaves_transcript_unchanged() {
        let loader = Arc::new(ScriptedLoader::new(ScriptedEngine::with(vec![])));
        let (mut session, _rx) = Session::new(config(), loader);

        let before = contents(&session);
        assert_eq!(session.send_message("hello"), Err(SessionError::NotReady));
        assert_eq!(session.send_message(""), Err(SessionError::NotReady));
        assert_eq!(contents(&session), before);
        assert!(matches!(session.status(), SessionStatus::Initializing(_)));
    }

    #[tokio::test]
    async fn test_successful_turn_appends_user_then_assistant() {
        let (mut session, mut rx, engine) =
            ready_session(vec![Scripted::Reply(ChatCompletion::single("hi there"))]).await;

        session.send_message("hello").unwrap();
        assert!(session.is_busy());
        pump_while(&mut session, &mut rx, |s| *s == SessionStatus::Busy).await;

        assert_eq!(
            contents(&session),
            vec![
                (ChatRole::System, SYSTEM.to_string()),
                (ChatRole::User, "hello".to_string()),
                (ChatRole::Assistant, "hi there".to_string()),
            ]
        );
        assert_eq!(session.status(), &SessionStatus::Ready);

        // Engine saw the full history including the system message
        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec![ChatMessage::system(SYSTEM), ChatMessage::user("hello")]);
    }

    #[tokio::test]
    async fn test_empty_choices_become_placeholder_reply() {
        let (mut session, mut rx, _) =
            ready_session(vec![Scripted::Reply(ChatCompletion::default())]).await;

        session.send_message("hello").unwrap();
        pump_while(&mut session, &mut rx, |s| *s == SessionStatus::Busy).await;

        let last = session.transcript().messages().last().unwrap();
        assert_eq!(last, &ChatMessage::assistant(NO_REPLY));
        assert_eq!(session.transcript().message_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_user_message_and_returns_to_ready() {
        let (mut session, mut rx, _) = ready_session(vec![Scripted::Fail("engine exploded")]).await;

        session.send_message("hello").unwrap();
        pump_while(&mut session, &mut rx, |s| *s == SessionStatus::Busy).await;

        assert_eq!(
            contents(&session),
            vec![
                (ChatRole::System, SYSTEM.to_string()),
                (ChatRole::User, "hello".to_string()),
            ]
        );
        assert_eq!(session.status(), &SessionStatus::Ready);
        assert_eq!(session.last_error(), Some("engine exploded"));
    }

    #[tokio::test]
    async fn test_next_send_clears_inline_error() {
        let (mut session, mut rx, engine) = ready_session(vec![
            Scripted::Fail("boom"),
            Scripted::Reply(ChatCompletion::single("second try")),
        ])
        .await;

        session.send_message("first").unwrap();
        pump_while(&mut session, &mut rx, |s| *s == SessionStatus::Busy).await;
        assert!(session.last_error().is_some());

        session.send_message("again").unwrap();
        assert_eq!(session.last_error(), None);
        pump_while(&mut session, &mut rx, |s| *s == SessionStatus::Busy).await;

        // The dangling user message is replayed on the next turn
        let seen = engine.seen.lock().unwrap();
        assert_eq!(
            seen[1],
            vec![
                ChatMessage::system(SYSTEM),
                ChatMessage::user("first"),
                ChatMessage::user("again"),
            ]
        );
        assert_eq!(session.transcript().visible_len(), 3);
    }

    #[tokio::test]
    async fn test_send_while_busy_is_rejected() {
        let (mut session, mut rx, _) =
            ready_session(vec![Scripted::Reply(ChatCompletion::single("one"))]).await;

        session.send_message("first").unwrap();
        let len = session.transcript().message_count();
        assert_eq!(session.send_message("second"), Err(SessionError::Busy));
        assert_eq!(session.transcript().message_count(), len);

        pump_while(&mut session, &mut rx, |s| *s == SessionStatus::Busy).await;
        assert_eq!(session.transcript().visible_len(), 2);
    }

    #[tokio::test]
    async fn test_system_message_first_and_hidden_after_turns() {
        let (mut session, mut rx, _) = ready_session(vec![
            Scripted::Reply(ChatCompletion::single("a")),
            Scripted::Reply(ChatCompletion::single("b")),
        ])
        .await;

        for text in ["one", "two"] {
            session.send_message(text).unwrap();
            pump_while(&mut session, &mut rx, |s| *s == SessionStatus::Busy).await;
        }

        let messages = session.transcript().messages();
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages.iter().filter(|m| m.role == ChatRole::System).count(), 1);
        assert!(session.transcript().visible().all(|m| m.role != ChatRole::System));
    }

    #[tokio::test]
    async fn test_init_failure_then_retry() {
        let engine = ScriptedEngine::with(vec![]);
        let loader = Arc::new(ScriptedLoader::new(engine));
        loader.failures.store(1, Ordering::SeqCst);
        let (mut session, mut rx) = Session::new(config(), loader.clone());

        session.initialize();
        pump_while(&mut session, &mut rx, |s| matches!(s, SessionStatus::Initializing(_))).await;
        assert_eq!(session.status(), &SessionStatus::Failed("model not found".to_string()));
        assert_eq!(session.send_message("hi"), Err(SessionError::NotReady));

        assert!(session.retry());
        assert!(matches!(session.status(), SessionStatus::Initializing(_)));
        pump_while(&mut session, &mut rx, |s| matches!(s, SessionStatus::Initializing(_))).await;
        assert!(session.is_ready());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        // Retry only applies to a failed session
        assert!(!session.retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_init_times_out() {
        let mut loader = ScriptedLoader::new(ScriptedEngine::with(vec![]));
        loader.stall = true;
        let mut cfg = config();
        cfg.init_timeout = Some(Duration::from_secs(30));
        let (mut session, mut rx) = Session::new(cfg, Arc::new(loader));

        session.initialize();
        pump_while(&mut session, &mut rx, |s| matches!(s, SessionStatus::Initializing(_))).await;
        assert!(matches!(session.status(), SessionStatus::Failed(r) if r.contains("timed out")));
    }

    #[tokio::test]
    async fn test_notice_clears_after_deadline() {
        let (mut session, _rx, _) = ready_session(vec![]).await;
        let notice = session.notice().cloned().unwrap();
        assert_eq!(notice.text, "Connected to test-model");

        session.clear_expired_notice(notice.expires_at - Duration::from_millis(1));
        assert!(session.notice().is_some());
        session.clear_expired_notice(notice.expires_at);
        assert!(session.notice().is_none());
    }

    #[tokio::test]
    async fn test_dispose_releases_engine() {
        let (mut session, _rx, engine) = ready_session(vec![]).await;
        session.dispose().await;
        assert!(engine.disposed.load(Ordering::SeqCst));
        assert_eq!(session.send_message("after"), Err(SessionError::NotReady));
    }

    #[tokio::test]
    async fn test_dispose_before_ready_is_noop() {
        let mut loader = ScriptedLoader::new(ScriptedEngine::with(vec![]));
        loader.stall = true;
        let engine = loader.engine.clone();
        let (mut session, _rx) = Session::new(config(), Arc::new(loader));
        session.initialize();
        session.dispose().await;
        assert!(!engine.disposed.load(Ordering::SeqCst));
    }
}
