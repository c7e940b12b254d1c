//! Agent orchestration.
//!
//! Ties the pieces together: skip everything when a valid durable credential
//! is on disk, otherwise run fallback sessions (with a cool-down between
//! failed ones) until a certificate request through one of the bootstrap
//! credentials is approved.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ca::CaCache;
use crate::config::{AgentConfig, DeniedCredentialPolicy};
use crate::csr::{CsrApi, CsrLifecycle, CsrOutcome, CsrSettings};
use crate::denied::DeniedLedger;
use crate::durable::{DurableRecord, DurableStore};
use crate::error::{AgentError, ConfigError};
use crate::events::TransitionLog;
use crate::fallback::{EngineSettings, FallbackEngine};
use crate::probe::ConnectionProbe;
use crate::retry::sleep_or_cancel;
use crate::secrets::SecretSource;
use crate::store::CredentialStore;

/// How the agent obtained its hub credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// A valid credential was already installed; no session ran.
    AlreadyBootstrapped(Arc<DurableRecord>),
    /// A session produced a new credential.
    Bootstrapped(Arc<DurableRecord>),
}

impl AgentOutcome {
    pub fn record(&self) -> &Arc<DurableRecord> {
        match self {
            AgentOutcome::AlreadyBootstrapped(record) | AgentOutcome::Bootstrapped(record) => {
                record
            }
        }
    }
}

/// The bootstrap agent.
pub struct Agent<S, H> {
    config: AgentConfig,
    store: CredentialStore<S>,
    hub: H,
    ca: Arc<CaCache>,
    durable: DurableStore,
    log: TransitionLog,
}

impl<S, H> Agent<S, H>
where
    S: SecretSource,
    H: ConnectionProbe + CsrApi + Clone,
{
    /// Validate `config` and set up the agent.
    pub fn new(
        config: AgentConfig,
        source: S,
        hub: H,
        ca: Arc<CaCache>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let store = CredentialStore::new(source, config.sources())?;
        let durable = DurableStore::new(&config.data_dir);

        Ok(Self {
            config,
            store,
            hub,
            ca,
            durable,
            log: TransitionLog::new(),
        })
    }

    /// Forward state transitions to `log` in addition to tracing.
    pub fn with_transition_log(mut self, log: TransitionLog) -> Self {
        self.log = log;
        self
    }

    /// Obtain a durable hub credential.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<AgentOutcome, AgentError> {
        let identity = self.config.identity();

        // First read of the process CA bundle
        let ca = self.ca.get()?;

        if let Some(record) = self.durable.load_valid(&identity, ca.as_deref()) {
            info!(
                identity = %identity,
                expires_at = %record.credential.expires_at,
                "Valid hub credential present, skipping bootstrap"
            );
            return Ok(AgentOutcome::AlreadyBootstrapped(record));
        }

        let mut ledger = match self.config.denied_credential_policy {
            DeniedCredentialPolicy::Persistent => Some(DeniedLedger::load(&self.config.data_dir)?),
            DeniedCredentialPolicy::Session => None,
        };

        let engine = FallbackEngine::new(
            self.hub.clone(),
            EngineSettings::from_config(&self.config),
            self.log.clone(),
        );
        let lifecycle = CsrLifecycle::new(
            self.hub.clone(),
            CsrSettings::from_config(&self.config),
            identity.clone(),
            self.durable.clone(),
            self.log.clone(),
        );

        info!(
            identity = %identity,
            sources = self.store.specs().len(),
            policy = ?self.config.denied_credential_policy,
            "Starting bootstrap"
        );

        let mut failed_sessions: u32 = 0;
        loop {
            let err = match self.run_session(&engine, &lifecycle, ledger.as_mut(), cancel).await {
                Ok(record) => return Ok(AgentOutcome::Bootstrapped(record)),
                Err(e @ AgentError::SessionFailed(_)) => e,
                Err(e @ AgentError::Config(ConfigError::NoUsableSources(_))) => e,
                Err(e) => return Err(e),
            };

            failed_sessions += 1;
            if self.config.max_sessions != 0 && failed_sessions >= self.config.max_sessions {
                warn!(sessions = failed_sessions, error = %err, "Giving up on bootstrap");
                return Err(err);
            }

            let backoff = self.config.session_backoff();
            info!(
                sessions = failed_sessions,
                backoff_secs = backoff.as_secs(),
                "Starting a new bootstrap session after backoff"
            );
            if !sleep_or_cancel(backoff, cancel).await {
                return Err(AgentError::Cancelled);
            }
        }
    }

    /// One session: fall back through candidates until a CSR is approved.
    async fn run_session<P: ConnectionProbe, A: CsrApi>(
        &self,
        engine: &FallbackEngine<P>,
        lifecycle: &CsrLifecycle<A>,
        mut ledger: Option<&mut DeniedLedger>,
        cancel: &CancellationToken,
    ) -> Result<Arc<DurableRecord>, AgentError> {
        let mut session = engine.start_session(self.store.load()?);
        if let Some(ledger) = ledger.as_deref() {
            ledger.apply(session.candidates_mut(), &self.log);
        }

        loop {
            let index = engine.run(&mut session, cancel).await?;
            let candidate = session.candidates()[index].clone();

            let rejection = match lifecycle.run(&candidate, cancel).await? {
                CsrOutcome::Ready(record) => return Ok(record),
                CsrOutcome::Rejected(rejection) => rejection,
            };

            if rejection.is_denial() {
                if let Some(ledger) = ledger.as_deref_mut() {
                    ledger.record(&candidate, rejection.request_id.clone())?;
                }
            }

            session.reject_selected(
                &format!("certificate request {}: {}", rejection.state, rejection.reason),
                &self.log,
            )?;
            self.store.refresh(session.candidates_mut(), &self.log);
        }
    }
}
