//! Bootstrap credential fallback.
//!
//! A [`FallbackSession`] walks a priority-ordered candidate list one probe at
//! a time until a candidate connects, every candidate has been tried, or the
//! session deadline passes. Each probe is bounded by the skip timeout.

use std::time::Duration;

use chrono::Utc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hubjoin_core::{BootstrapCredential, CoreError, CredentialState, ProbeErrorKind};

use crate::config::AgentConfig;
use crate::error::{AgentError, SessionFailure, SessionFailureReason};
use crate::events::{Machine, TransitionLog};
use crate::probe::ConnectionProbe;

/// Timing knobs for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound on a single probe.
    pub skip_after: Duration,
    /// Upper bound on a whole session.
    pub hub_connection_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            skip_after: config.skip_after(),
            hub_connection_timeout: config.hub_connection_timeout(),
        }
    }
}

/// One pass over the candidate list.
#[derive(Debug)]
pub struct FallbackSession {
    candidates: Vec<BootstrapCredential>,
    cursor: usize,
    deadline: Instant,
    attempted: usize,
    selected: Option<usize>,
}

impl FallbackSession {
    /// Start a session over already ordered `candidates`.
    pub fn new(candidates: Vec<BootstrapCredential>, deadline: Instant) -> Self {
        Self {
            candidates,
            cursor: 0,
            deadline,
            attempted: 0,
            selected: None,
        }
    }

    pub fn candidates(&self) -> &[BootstrapCredential] {
        &self.candidates
    }

    /// Mutable access for source refresh and skip marking. State changes
    /// must go through the credential's transition methods.
    pub fn candidates_mut(&mut self) -> &mut [BootstrapCredential] {
        &mut self.candidates
    }

    /// Index of the next candidate to consider.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Number of probes started in this session.
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    /// The selected candidate, if any.
    pub fn selected(&self) -> Option<&BootstrapCredential> {
        self.selected.map(|i| &self.candidates[i])
    }

    /// Fail the selected candidate after the hub turned down the identity
    /// obtained through it. The session resumes at the next candidate.
    ///
    /// Returns the index of the rejected candidate.
    pub fn reject_selected(
        &mut self,
        reason: &str,
        log: &TransitionLog,
    ) -> Result<usize, CoreError> {
        let index = self.selected.ok_or_else(|| CoreError::InvalidStateTransition {
            from: "none selected".to_string(),
            to: CredentialState::Failed.to_string(),
        })?;

        let candidate = &mut self.candidates[index];
        candidate.reject(Utc::now())?;
        log.record(
            Machine::Fallback,
            &candidate.source_ref,
            CredentialState::Selected,
            CredentialState::Failed,
            reason,
        );

        self.selected = None;
        self.cursor = index + 1;
        Ok(index)
    }

    fn untried(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.state() == CredentialState::Untried)
            .count()
    }
}

enum ProbeOutcome {
    Connected,
    Failed(ProbeErrorKind, String),
    TimedOut { clipped: bool },
    Cancelled,
}

/// Drives sessions against a [`ConnectionProbe`].
pub struct FallbackEngine<P> {
    probe: P,
    settings: EngineSettings,
    log: TransitionLog,
}

impl<P: ConnectionProbe> FallbackEngine<P> {
    pub fn new(probe: P, settings: EngineSettings, log: TransitionLog) -> Self {
        Self {
            probe,
            settings,
            log,
        }
    }

    /// Open a session whose deadline starts now.
    pub fn start_session(&self, candidates: Vec<BootstrapCredential>) -> FallbackSession {
        FallbackSession::new(
            candidates,
            Instant::now() + self.settings.hub_connection_timeout,
        )
    }

    /// Probe from the session cursor until a candidate is selected.
    ///
    /// Returns the index of the selected candidate. On shutdown the probe in
    /// flight is abandoned and its candidate returns to `Untried`.
    pub async fn run(
        &self,
        session: &mut FallbackSession,
        cancel: &CancellationToken,
    ) -> Result<usize, AgentError> {
        if let Some(index) = session.selected {
            return Ok(index);
        }

        while session.cursor < session.candidates.len() {
            let index = session.cursor;

            let state = session.candidates[index].state();
            if !state.is_probeable() {
                debug!(
                    source = %session.candidates[index].source_ref,
                    state = %state,
                    "Passing over candidate"
                );
                session.cursor += 1;
                continue;
            }

            let now = Instant::now();
            if now >= session.deadline {
                return Err(self.session_failed(session, SessionFailureReason::DeadlineExceeded));
            }
            let budget = self.settings.skip_after.min(session.deadline - now);
            let clipped = budget < self.settings.skip_after;

            let candidate = &mut session.candidates[index];
            candidate.begin_probe()?;
            session.attempted += 1;
            self.log.record(
                Machine::Fallback,
                &candidate.source_ref,
                CredentialState::Untried,
                CredentialState::Probing,
                format!("probing {} (priority {})", candidate.endpoint.server, candidate.priority),
            );

            let outcome = self
                .probe_once(&session.candidates[index], budget, clipped, cancel)
                .await;
            let candidate = &mut session.candidates[index];

            match outcome {
                ProbeOutcome::Connected => {
                    candidate.select()?;
                    self.log.record(
                        Machine::Fallback,
                        &candidate.source_ref,
                        CredentialState::Probing,
                        CredentialState::Selected,
                        "hub connection established",
                    );
                    info!(
                        source = %candidate.source_ref,
                        priority = candidate.priority,
                        attempted = session.attempted,
                        "Selected bootstrap credential"
                    );
                    session.selected = Some(index);
                    return Ok(index);
                }
                ProbeOutcome::Failed(kind, message) => {
                    candidate.fail(kind, Utc::now())?;
                    self.log.record(
                        Machine::Fallback,
                        &candidate.source_ref,
                        CredentialState::Probing,
                        CredentialState::Failed,
                        format!("{}: {}", kind, message),
                    );
                }
                ProbeOutcome::TimedOut { clipped } => {
                    candidate.fail(ProbeErrorKind::Timeout, Utc::now())?;
                    self.log.record(
                        Machine::Fallback,
                        &candidate.source_ref,
                        CredentialState::Probing,
                        CredentialState::Failed,
                        format!("{}: no answer within {:?}", ProbeErrorKind::Timeout, budget),
                    );
                    if clipped {
                        return Err(
                            self.session_failed(session, SessionFailureReason::DeadlineExceeded)
                        );
                    }
                }
                ProbeOutcome::Cancelled => {
                    candidate.abandon_probe()?;
                    self.log.record(
                        Machine::Fallback,
                        &candidate.source_ref,
                        CredentialState::Probing,
                        CredentialState::Untried,
                        "shutdown requested",
                    );
                    return Err(AgentError::Cancelled);
                }
            }

            session.cursor += 1;
        }

        Err(self.session_failed(session, SessionFailureReason::Exhausted))
    }

    async fn probe_once(
        &self,
        candidate: &BootstrapCredential,
        budget: Duration,
        clipped: bool,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ProbeOutcome::Cancelled,
            result = timeout(budget, self.probe.attempt(candidate, budget)) => match result {
                Ok(result) if result.ok => ProbeOutcome::Connected,
                Ok(result) => ProbeOutcome::Failed(
                    result.error_kind.unwrap_or(ProbeErrorKind::Unreachable),
                    result.message.unwrap_or_default(),
                ),
                Err(_) => ProbeOutcome::TimedOut { clipped },
            },
        }
    }

    fn session_failed(
        &self,
        session: &FallbackSession,
        reason: SessionFailureReason,
    ) -> AgentError {
        let failure = SessionFailure {
            reason,
            attempted: session.attempted,
            untried: session.untried(),
        };
        warn!(
            attempted = failure.attempted,
            untried = failure.untried,
            candidates = session.candidates.len(),
            "Bootstrap session failed: {}", failure
        );
        AgentError::SessionFailed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hubjoin_core::SecretRef;

    use crate::probe::tests::{Script, ScriptedProbe};
    use crate::store::tests::{kubeconfig, MemorySecrets};
    use crate::store::{CredentialStore, SourceSpec};

    const SKIP: Duration = Duration::from_secs(60);
    const HUB_TIMEOUT: Duration = Duration::from_secs(600);

    /// Candidates loaded and ordered the way the agent does it.
    fn candidates(sources: &[(&str, i32)]) -> Vec<BootstrapCredential> {
        let secrets = Arc::new(MemorySecrets::default());
        let mut specs = Vec::new();
        for (name, priority) in sources {
            let r = SecretRef::new("agent", *name);
            secrets.put(&r, &kubeconfig(&format!("http://{}.hub", name)));
            specs.push(SourceSpec::new(r, *priority));
        }
        CredentialStore::new(secrets, specs).unwrap().load().unwrap()
    }

    fn engine(
        probe: Arc<ScriptedProbe>,
        skip: Duration,
        hub_timeout: Duration,
    ) -> FallbackEngine<Arc<ScriptedProbe>> {
        FallbackEngine::new(
            probe,
            EngineSettings {
                skip_after: skip,
                hub_connection_timeout: hub_timeout,
            },
            TransitionLog::new(),
        )
    }

    fn states(session: &FallbackSession) -> Vec<CredentialState> {
        session.candidates().iter().map(|c| c.state()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_broken_by_declaration_order_and_stops_at_first_success() {
        let probe = ScriptedProbe::with(&[
            ("A", Script::Fail(ProbeErrorKind::AuthRejected)),
            ("B", Script::Ok),
            ("C", Script::Ok),
        ]);
        let engine = engine(probe.clone(), SKIP, HUB_TIMEOUT);
        let mut session = engine.start_session(candidates(&[("A", 1), ("B", 1), ("C", 2)]));

        let selected = engine
            .run(&mut session, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.candidates()[selected].source_ref.name, "B");
        assert_eq!(probe.calls(), vec!["A", "B"]);
        assert_eq!(
            states(&session),
            vec![
                CredentialState::Failed,
                CredentialState::Selected,
                CredentialState::Untried
            ]
        );
        assert_eq!(
            session.candidates()[0].last_error(),
            Some(ProbeErrorKind::AuthRejected)
        );
        assert!(session.candidates()[0].failed_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_in_priority_order_not_declaration_order() {
        let probe = ScriptedProbe::with(&[]);
        let engine = engine(probe.clone(), SKIP, HUB_TIMEOUT);
        let mut session =
            engine.start_session(candidates(&[("low", 9), ("high", -1), ("mid", 3), ("mid2", 3)]));

        let _ = engine.run(&mut session, &CancellationToken::new()).await;
        assert_eq!(probe.calls(), vec!["high", "mid", "mid2", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fail_leaves_nothing_selected() {
        let probe = ScriptedProbe::with(&[
            ("a", Script::Fail(ProbeErrorKind::Unreachable)),
            ("b", Script::Fail(ProbeErrorKind::MalformedCredential)),
        ]);
        let engine = engine(probe, SKIP, HUB_TIMEOUT);
        let mut session = engine.start_session(candidates(&[("a", 0), ("b", 1)]));

        let err = engine
            .run(&mut session, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            AgentError::SessionFailed(failure) => {
                assert_eq!(failure.reason, SessionFailureReason::Exhausted);
                assert_eq!(failure.attempted, 2);
                assert_eq!(failure.untried, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(session.selected().is_none());
        assert!(session
            .candidates()
            .iter()
            .all(|c| c.state() == CredentialState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_is_cut_off_at_skip_timeout() {
        let probe = ScriptedProbe::with(&[
            ("hangs", Script::Hang(Duration::from_secs(90))),
            ("works", Script::Ok),
        ]);
        let engine = engine(probe, SKIP, HUB_TIMEOUT);
        let mut session = engine.start_session(candidates(&[("hangs", 0), ("works", 1)]));

        let start = Instant::now();
        let selected = engine
            .run(&mut session, &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(selected, 1);
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(61));
        assert_eq!(session.candidates()[0].state(), CredentialState::Failed);
        assert_eq!(
            session.candidates()[0].last_error(),
            Some(ProbeErrorKind::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_explicit_failure_differ_only_in_kind() {
        let hang = ScriptedProbe::with(&[("x", Script::Hang(Duration::from_secs(90)))]);
        let fail = ScriptedProbe::with(&[("x", Script::Fail(ProbeErrorKind::Unreachable))]);

        let mut outcomes = Vec::new();
        for probe in [hang, fail] {
            let engine = engine(probe, SKIP, HUB_TIMEOUT);
            let mut session = engine.start_session(candidates(&[("x", 0), ("y", 1)]));
            let result = engine.run(&mut session, &CancellationToken::new()).await;
            outcomes.push((
                matches!(result, Err(AgentError::SessionFailed(_))),
                states(&session),
                session.cursor(),
                session.candidates()[0].last_error(),
            ));
        }

        assert_eq!(outcomes[0].0, outcomes[1].0);
        assert_eq!(outcomes[0].1, outcomes[1].1);
        assert_eq!(outcomes[0].2, outcomes[1].2);
        assert_eq!(outcomes[0].3, Some(ProbeErrorKind::Timeout));
        assert_eq!(outcomes[1].3, Some(ProbeErrorKind::Unreachable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_leaves_remaining_candidates_untried() {
        let hang = Script::Hang(Duration::from_secs(90));
        let probe = ScriptedProbe::with(&[
            ("a", hang.clone()),
            ("b", hang.clone()),
            ("c", hang.clone()),
            ("d", Script::Ok),
        ]);
        let engine = engine(probe.clone(), SKIP, Duration::from_secs(150));
        let mut session =
            engine.start_session(candidates(&[("a", 0), ("b", 1), ("c", 2), ("d", 3)]));

        let start = Instant::now();
        let err = engine
            .run(&mut session, &CancellationToken::new())
            .await
            .unwrap_err();

        // a and b fail at 60s each, c is clipped to the last 30s
        assert!(start.elapsed() >= Duration::from_secs(150));
        assert!(start.elapsed() < Duration::from_secs(151));
        match err {
            AgentError::SessionFailed(failure) => {
                assert_eq!(failure.reason, SessionFailureReason::DeadlineExceeded);
                assert_eq!(failure.attempted, 3);
                assert_eq!(failure.untried, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(probe.calls(), vec!["a", "b", "c"]);
        assert_eq!(session.candidates()[3].state(), CredentialState::Untried);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_probes_nothing() {
        let probe = ScriptedProbe::with(&[("a", Script::Ok)]);
        let engine = engine(probe.clone(), SKIP, HUB_TIMEOUT);
        let mut session = FallbackSession::new(candidates(&[("a", 0)]), Instant::now());

        let err = engine
            .run(&mut session, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::SessionFailed(SessionFailure {
                reason: SessionFailureReason::DeadlineExceeded,
                attempted: 0,
                untried: 1
            })
        ));
        assert!(probe.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_and_evicted_candidates_are_passed_over() {
        let probe = ScriptedProbe::with(&[("a", Script::Ok), ("b", Script::Ok), ("c", Script::Ok)]);
        let engine = engine(probe.clone(), SKIP, HUB_TIMEOUT);
        let mut session = engine.start_session(candidates(&[("a", 0), ("b", 1), ("c", 2)]));
        session.candidates_mut()[0].skip().unwrap();
        session.candidates_mut()[1].evict(Utc::now());

        let selected = engine
            .run(&mut session, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(selected, 2);
        assert_eq!(probe.calls(), vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_resumes_at_next_candidate() {
        let probe = ScriptedProbe::with(&[("a", Script::Ok), ("b", Script::Ok), ("c", Script::Ok)]);
        let engine = engine(probe.clone(), SKIP, HUB_TIMEOUT);
        let mut session = engine.start_session(candidates(&[("a", 0), ("b", 1), ("c", 2)]));
        let cancel = CancellationToken::new();

        assert_eq!(engine.run(&mut session, &cancel).await.unwrap(), 0);
        // Running again without a rejection keeps the selection
        assert_eq!(engine.run(&mut session, &cancel).await.unwrap(), 0);

        let log = TransitionLog::new();
        assert_eq!(session.reject_selected("CSR denied", &log).unwrap(), 0);
        assert_eq!(session.cursor(), 1);

        assert_eq!(engine.run(&mut session, &cancel).await.unwrap(), 1);
        assert_eq!(probe.calls(), vec!["a", "b"]);
        assert_eq!(
            states(&session),
            vec![
                CredentialState::Failed,
                CredentialState::Selected,
                CredentialState::Untried
            ]
        );
    }

    #[test]
    fn test_reject_without_selection_is_an_error() {
        let mut session = FallbackSession::new(candidates(&[("a", 0)]), Instant::now());
        assert!(session
            .reject_selected("denied", &TransitionLog::new())
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_probe_in_flight() {
        let probe = ScriptedProbe::with(&[("slow", Script::Hang(Duration::from_secs(50)))]);
        let engine = engine(probe, SKIP, HUB_TIMEOUT);
        let mut session = engine.start_session(candidates(&[("slow", 0), ("other", 1)]));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = engine.run(&mut session, &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(11));
        assert_eq!(
            states(&session),
            vec![CredentialState::Untried, CredentialState::Untried]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_reported() {
        let probe = ScriptedProbe::with(&[
            ("a", Script::Fail(ProbeErrorKind::Unreachable)),
            ("b", Script::Ok),
        ]);
        let (log, mut rx) = TransitionLog::with_channel();
        let engine = FallbackEngine::new(
            probe,
            EngineSettings {
                skip_after: SKIP,
                hub_connection_timeout: HUB_TIMEOUT,
            },
            log,
        );
        let mut session = engine.start_session(candidates(&[("a", 0), ("b", 1)]));
        engine
            .run(&mut session, &CancellationToken::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(t) = rx.try_recv() {
            assert_eq!(t.machine, Machine::Fallback);
            seen.push((t.subject, t.from, t.to));
        }
        assert_eq!(
            seen,
            vec![
                ("agent/a".to_string(), "Untried".to_string(), "Probing".to_string()),
                ("agent/a".to_string(), "Probing".to_string(), "Failed".to_string()),
                ("agent/b".to_string(), "Untried".to_string(), "Probing".to_string()),
                ("agent/b".to_string(), "Probing".to_string(), "Selected".to_string()),
            ]
        );
    }
}
