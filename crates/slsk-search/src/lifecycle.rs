//! The lifecycle of outgoing searches.
//!
//! A search moves `Requested → InProgress → Completed·<reason>`, and the
//! terminal states are sticky: nothing transitions out of them.  While a
//! search is in flight, responses stream into memory and the progress
//! counters are persisted on every event; the response list itself is
//! persisted exactly once, at the terminal transition.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slsk_error::ErrorReport as _;
use slsk_shares::SharedFile;

use crate::err::SearchError;
use crate::store::SearchStore;

/// Why a search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CompletionReason {
    /// The search's timeout elapsed.
    TimedOut,
    /// The response limit was reached.
    ResponseLimitReached,
    /// The file limit was reached.
    FileLimitReached,
    /// The backend reported an error.
    Errored,
    /// The search was cancelled by its owner.
    Cancelled,
}

/// The state of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SearchState {
    /// Created, not yet handed to the backend.
    Requested,
    /// Running; responses may be arriving.
    InProgress,
    /// Finished for the given reason.  Terminal and sticky.
    Completed(CompletionReason),
}

impl SearchState {
    /// True for the `Completed·*` states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchState::Completed(_))
    }
}

impl Display for SearchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchState::Requested => "requested",
            SearchState::InProgress => "in_progress",
            SearchState::Completed(CompletionReason::TimedOut) => "completed/timed_out",
            SearchState::Completed(CompletionReason::ResponseLimitReached) => {
                "completed/response_limit_reached"
            }
            SearchState::Completed(CompletionReason::FileLimitReached) => {
                "completed/file_limit_reached"
            }
            SearchState::Completed(CompletionReason::Errored) => "completed/errored",
            SearchState::Completed(CompletionReason::Cancelled) => "completed/cancelled",
        };
        write!(f, "{s}")
    }
}

/// Error parsing a persisted [`SearchState`].
#[derive(Debug, Clone, Error)]
#[error("unrecognised search state {0:?}")]
pub struct ParseStateError(String);

impl FromStr for SearchState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "requested" => SearchState::Requested,
            "in_progress" => SearchState::InProgress,
            "completed/timed_out" => SearchState::Completed(CompletionReason::TimedOut),
            "completed/response_limit_reached" => {
                SearchState::Completed(CompletionReason::ResponseLimitReached)
            }
            "completed/file_limit_reached" => {
                SearchState::Completed(CompletionReason::FileLimitReached)
            }
            "completed/errored" => SearchState::Completed(CompletionReason::Errored),
            "completed/cancelled" => SearchState::Completed(CompletionReason::Cancelled),
            other => return Err(ParseStateError(other.to_owned())),
        })
    }
}

/// One peer's response to an outgoing search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)] // plain data carrier
pub struct PeerResponse {
    /// The responding user.
    pub username: String,
    /// Whether the peer could start an upload immediately.
    pub has_free_upload_slot: bool,
    /// The peer's reported upload speed, bytes per second.
    pub upload_speed: u64,
    /// The peer's reported queue length.
    pub queue_length: usize,
    /// Files the peer offers.
    pub files: Vec<SharedFile>,
    /// Files the peer holds but has locked away from us.
    pub locked_files: Vec<SharedFile>,
}

/// Where a search is sent.
///
/// The precise scope set is owned by the peer-protocol library; the
/// lifecycle treats it as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SearchScope {
    /// The whole network.
    Network,
    /// The recurring wishlist rotation.
    Wishlist,
    /// One chat room.
    Room(String),
    /// A fixed set of users.
    Users(Vec<String>),
}

/// Limits and timeout for one search.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SearchOptions {
    /// Stop after this many responses.
    pub response_limit: usize,
    /// Stop after this many files (across responses).
    pub file_limit: usize,
    /// Stop after this long.
    pub timeout: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            response_limit: 100,
            file_limit: 10_000,
            timeout: Duration::from_secs(15),
        }
    }
}

/// One persisted search.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)] // plain data carrier, mirrors the table
pub struct SearchRecord {
    /// The search's id.
    pub id: Uuid,
    /// The query text.
    pub search_text: String,
    /// The peer-protocol token, 0 until assigned.
    pub token: u32,
    /// Current state.
    pub state: SearchState,
    /// When the search was created.
    pub started_at: SystemTime,
    /// When the search reached a terminal state.
    pub ended_at: Option<SystemTime>,
    /// Responses received so far.
    pub response_count: usize,
    /// Files received so far.
    pub file_count: usize,
    /// Locked files received so far.
    pub locked_file_count: usize,
    /// The response list; present only when fetched with
    /// `include_responses` and only after the terminal transition.
    pub responses: Option<Vec<PeerResponse>>,
}

/// The peer-protocol side of an outgoing search.
///
/// The real implementation lives with the wire library; tests use an
/// in-memory fake.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Obtain a fresh search token.
    fn next_token(&self) -> u32;

    /// Run the search to completion, streaming responses into `responses`
    /// as they arrive.  Implementations must stop promptly when `cancel`
    /// fires and must respect `options.timeout`.
    async fn run(
        &self,
        text: String,
        token: u32,
        scope: SearchScope,
        options: SearchOptions,
        responses: mpsc::Sender<PeerResponse>,
        cancel: CancellationToken,
    ) -> Result<CompletionReason, SearchError>;
}

/// Drives outgoing searches and owns their persistence.
pub struct SearchService {
    /// The persistent store.
    store: Arc<SearchStore>,
    /// The peer-protocol backend.
    backend: Arc<dyn SearchBackend>,
    /// Cancellation handles for in-flight searches.
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl SearchService {
    /// Construct a service over the given store and backend.
    pub fn new(store: Arc<SearchStore>, backend: Arc<dyn SearchBackend>) -> Arc<Self> {
        Arc::new(SearchService {
            store,
            backend,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Create a search and start driving it.
    ///
    /// The record is inserted (state `Requested`) before this returns;
    /// the search itself runs on a spawned task.
    pub fn create(
        self: &Arc<Self>,
        id: Uuid,
        search_text: impl Into<String>,
        scope: SearchScope,
        options: SearchOptions,
    ) -> Result<(), SearchError> {
        let search_text = search_text.into();
        self.store.insert(&SearchRecord {
            id,
            search_text: search_text.clone(),
            token: 0,
            state: SearchState::Requested,
            started_at: SystemTime::now(),
            ended_at: None,
            response_count: 0,
            file_count: 0,
            locked_file_count: 0,
            responses: None,
        })?;

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().map_err(|_| SearchError::Poisoned)?;
            active.insert(id, cancel.clone());
        }
        info!(%id, text = %search_text, "search created");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.drive(id, search_text, scope, options, cancel).await {
                warn!(%id, "search failed: {}", e.report());
            }
            if let Ok(mut active) = this.active.lock() {
                active.remove(&id);
            }
        });
        Ok(())
    }

    /// Run one search to its terminal state.
    async fn drive(
        &self,
        id: Uuid,
        text: String,
        scope: SearchScope,
        options: SearchOptions,
        cancel: CancellationToken,
    ) -> Result<(), SearchError> {
        let token = self.backend.next_token();
        self.store.set_state(id, &SearchState::InProgress, token)?;

        // The backend gets a child token so that hitting a limit can stop
        // it without marking the search cancelled.
        let work = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(32);
        let run = self.backend.run(
            text,
            token,
            scope,
            options.clone(),
            tx,
            work.clone(),
        );
        tokio::pin!(run);

        let mut responses: Vec<PeerResponse> = Vec::new();
        let mut file_count = 0_usize;
        let mut locked_file_count = 0_usize;
        let mut run_outcome: Option<Result<CompletionReason, SearchError>> = None;

        let reason = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    work.cancel();
                    break CompletionReason::Cancelled;
                }
                outcome = &mut run, if run_outcome.is_none() => {
                    run_outcome = Some(outcome);
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(response) => {
                            file_count += response.files.len();
                            locked_file_count += response.locked_files.len();
                            responses.push(response);
                            self.store.update_progress(
                                id,
                                responses.len(),
                                file_count,
                                locked_file_count,
                            )?;
                            if responses.len() >= options.response_limit {
                                work.cancel();
                                break CompletionReason::ResponseLimitReached;
                            }
                            if file_count >= options.file_limit {
                                work.cancel();
                                break CompletionReason::FileLimitReached;
                            }
                        }
                        // The backend dropped its sender: no more
                        // responses are coming.
                        None => match run_outcome.take() {
                            Some(Ok(reason)) => break reason,
                            Some(Err(e)) => {
                                warn!(%id, "backend error: {}", e.report());
                                break CompletionReason::Errored;
                            }
                            None => break (&mut run).await.unwrap_or(CompletionReason::Errored),
                        },
                    }
                }
            }
        };

        let state = SearchState::Completed(reason);
        let wrote = self.store.finalize(
            id,
            &state,
            SystemTime::now(),
            responses.len(),
            file_count,
            locked_file_count,
            &responses,
        )?;
        if !wrote {
            // A terminal write already happened; terminal states are
            // sticky, so this invocation's outcome is discarded.
            debug!(%id, "search already finalized");
        } else {
            info!(%id, %state, responses = responses.len(), "search completed");
        }
        Ok(())
    }

    /// Cancel an in-flight search.
    ///
    /// Returns true if a running search was told to stop.  Cancelling a
    /// search that already reached a terminal state changes nothing.
    pub fn cancel(&self, id: Uuid) -> Result<bool, SearchError> {
        let active = self.active.lock().map_err(|_| SearchError::Poisoned)?;
        match active.get(&id) {
            Some(token) => {
                token.cancel();
                info!(%id, "search cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fetch one search.
    pub fn find(
        &self,
        id: Uuid,
        include_responses: bool,
    ) -> Result<Option<SearchRecord>, SearchError> {
        self.store.find(id, include_responses)
    }

    /// List all searches, most recent first.
    pub fn list(&self) -> Result<Vec<SearchRecord>, SearchError> {
        self.store.list()
    }

    /// Remove one search's record.
    pub fn delete(&self, id: Uuid) -> Result<bool, SearchError> {
        self.store.delete(id)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// A backend that emits a scripted set of responses, then reports a
    /// scripted reason (unless cancelled first).
    struct ScriptedBackend {
        /// Responses to emit.
        responses: Vec<PeerResponse>,
        /// Terminal reason to report.
        reason: CompletionReason,
        /// If set, never finish on our own; wait for cancellation.
        hang: bool,
    }

    #[async_trait]
    impl SearchBackend for ScriptedBackend {
        fn next_token(&self) -> u32 {
            4242
        }

        async fn run(
            &self,
            _text: String,
            _token: u32,
            _scope: SearchScope,
            _options: SearchOptions,
            responses: mpsc::Sender<PeerResponse>,
            cancel: CancellationToken,
        ) -> Result<CompletionReason, SearchError> {
            for r in self.responses.clone() {
                if responses.send(r).await.is_err() {
                    break;
                }
            }
            if self.hang {
                cancel.cancelled().await;
                return Ok(CompletionReason::Cancelled);
            }
            Ok(self.reason)
        }
    }

    fn response(username: &str, files: usize) -> PeerResponse {
        PeerResponse {
            username: username.to_owned(),
            has_free_upload_slot: true,
            upload_speed: 100,
            queue_length: 0,
            files: (0..files)
                .map(|i| SharedFile {
                    filename: format!(r"Music\{username}\{i}.mp3"),
                    size: 1,
                    properties: Default::default(),
                })
                .collect(),
            locked_files: Vec::new(),
        }
    }

    fn service(backend: ScriptedBackend) -> Arc<SearchService> {
        SearchService::new(
            Arc::new(SearchStore::open_in_memory().unwrap()),
            Arc::new(backend),
        )
    }

    async fn wait_terminal(svc: &SearchService, id: Uuid) -> SearchRecord {
        for _ in 0..200 {
            if let Some(rec) = svc.find(id, true).unwrap() {
                if rec.state.is_terminal() {
                    return rec;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("search never reached a terminal state");
    }

    #[tokio::test]
    async fn runs_to_timeout_with_responses() {
        let svc = service(ScriptedBackend {
            responses: vec![response("peer1", 2), response("peer2", 3)],
            reason: CompletionReason::TimedOut,
            hang: false,
        });
        let id = Uuid::new_v4();
        svc.create(id, "beatles", SearchScope::Network, SearchOptions::default())
            .unwrap();

        let rec = wait_terminal(&svc, id).await;
        assert_eq!(rec.state, SearchState::Completed(CompletionReason::TimedOut));
        assert_eq!(rec.token, 4242);
        assert_eq!(rec.response_count, 2);
        assert_eq!(rec.file_count, 5);
        assert!(rec.ended_at.is_some());
        assert_eq!(rec.responses.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn response_limit_terminates() {
        let svc = service(ScriptedBackend {
            responses: (0..10).map(|i| response(&format!("p{i}"), 1)).collect(),
            reason: CompletionReason::TimedOut,
            hang: true,
        });
        let id = Uuid::new_v4();
        let options = SearchOptions {
            response_limit: 3,
            ..Default::default()
        };
        svc.create(id, "query", SearchScope::Network, options).unwrap();

        let rec = wait_terminal(&svc, id).await;
        assert_eq!(
            rec.state,
            SearchState::Completed(CompletionReason::ResponseLimitReached)
        );
        assert_eq!(rec.response_count, 3);
    }

    #[tokio::test]
    async fn file_limit_terminates() {
        let svc = service(ScriptedBackend {
            responses: vec![response("p1", 4), response("p2", 4)],
            reason: CompletionReason::TimedOut,
            hang: true,
        });
        let id = Uuid::new_v4();
        let options = SearchOptions {
            file_limit: 5,
            ..Default::default()
        };
        svc.create(id, "query", SearchScope::Network, options).unwrap();

        let rec = wait_terminal(&svc, id).await;
        assert_eq!(
            rec.state,
            SearchState::Completed(CompletionReason::FileLimitReached)
        );
    }

    #[tokio::test]
    async fn cancel_in_flight() {
        let svc = service(ScriptedBackend {
            responses: vec![response("p1", 1)],
            reason: CompletionReason::TimedOut,
            hang: true,
        });
        let id = Uuid::new_v4();
        svc.create(id, "query", SearchScope::Network, SearchOptions::default())
            .unwrap();

        // Let the task start and the backend park itself.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(svc.cancel(id).unwrap());

        let rec = wait_terminal(&svc, id).await;
        assert_eq!(
            rec.state,
            SearchState::Completed(CompletionReason::Cancelled)
        );
        // Terminal now; cancelling again is a no-op.
        assert!(!svc.cancel(id).unwrap());
    }

    #[tokio::test]
    async fn duplicate_ids_conflict() {
        let svc = service(ScriptedBackend {
            responses: vec![],
            reason: CompletionReason::TimedOut,
            hang: false,
        });
        let id = Uuid::new_v4();
        svc.create(id, "one", SearchScope::Network, SearchOptions::default())
            .unwrap();
        assert!(matches!(
            svc.create(id, "two", SearchScope::Network, SearchOptions::default()),
            Err(SearchError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn state_round_trips_through_strings() {
        let states = [
            SearchState::Requested,
            SearchState::InProgress,
            SearchState::Completed(CompletionReason::TimedOut),
            SearchState::Completed(CompletionReason::ResponseLimitReached),
            SearchState::Completed(CompletionReason::FileLimitReached),
            SearchState::Completed(CompletionReason::Errored),
            SearchState::Completed(CompletionReason::Cancelled),
        ];
        for s in states {
            let parsed: SearchState = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
        assert!("bogus".parse::<SearchState>().is_err());
    }
}
