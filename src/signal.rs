//! Signal bring-up for the chat feature.
//!
//! STATES
//! ======
//! UNINITIALIZED → INITIALIZING → READY
//!                              → FAILED → INITIALIZING (retry allowed)
//!
//! Every transition goes through `begin()` / `finish()`; a second caller
//! while INITIALIZING or READY is skipped, never run twice.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::{ChatError, ChatService};
use crate::config::Credentials;
use crate::connection::Connection;
use crate::error::ErrorCode;
use crate::inbox::{ChatSummary, PendingMessage};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignalState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadyInitiated,
    /// Another caller is mid-initiation.
    InProgress,
    MissingAccessToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiation {
    Initiated,
    Skipped(SkipReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalStep {
    Init,
    RegisterAccount,
    SetFcmId,
}

impl fmt::Display for SignalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::RegisterAccount => "register_account",
            Self::SetFcmId => "set_fcm_id",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("signal {step} failed: {source}")]
pub struct SignalError {
    pub step: SignalStep,
    #[source]
    pub source: ChatError,
}

impl ErrorCode for SignalError {
    fn error_code(&self) -> &'static str {
        match self.step {
            SignalStep::Init => "E_SIGNAL_INIT",
            SignalStep::RegisterAccount => "E_SIGNAL_REGISTER",
            SignalStep::SetFcmId => "E_SIGNAL_FCM",
        }
    }

    fn retryable(&self) -> bool {
        self.source.retryable()
    }
}

/// Events published to the application store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    SignalInitiated,
    UpdateChats(Vec<ChatSummary>),
    AddWebsocketReceivedMessage(PendingMessage),
}

/// Session state the flow reads credentials from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub is_online: bool,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub wallet_id: Option<String>,
    pub eth_address: Option<String>,
    pub fcm_token: Option<String>,
}

impl SessionContext {
    /// Credentials for `host`, or `None` without an access token.
    #[must_use]
    pub fn credentials(&self, host: &str) -> Option<Credentials> {
        let access_token = self.access_token.clone().filter(|t| !t.trim().is_empty())?;
        Some(Credentials {
            host: host.to_owned(),
            access_token,
            refresh_token: self.refresh_token.clone(),
            username: self.username.clone(),
            user_id: self.user_id.clone(),
            wallet_id: self.wallet_id.clone(),
            eth_address: self.eth_address.clone(),
            fcm_token: self.fcm_token.clone(),
        })
    }
}

pub struct SignalSession {
    service: ChatService,
    host: String,
    dispatch: mpsc::UnboundedSender<Action>,
    state: Mutex<SignalState>,
}

impl SignalSession {
    #[must_use]
    pub fn new(service: ChatService, host: impl Into<String>, dispatch: mpsc::UnboundedSender<Action>) -> Self {
        Self { service, host: host.into(), dispatch, state: Mutex::new(SignalState::Uninitialized) }
    }

    #[must_use]
    pub fn state(&self) -> SignalState {
        *self.lock_state()
    }

    #[must_use]
    pub fn service(&self) -> &ChatService {
        &self.service
    }

    /// Initialise the chat client and register the account once per session.
    ///
    /// Credentials are built from `ctx` when none are supplied. Being offline,
    /// a running or finished initiation, or a missing access token is a skip,
    /// checked in that order.
    ///
    /// # Errors
    ///
    /// Returns a [`SignalError`] naming the failed step; the state becomes
    /// `Failed` and a later call may try again.
    pub async fn initiate(
        &self,
        ctx: &SessionContext,
        credentials: Option<Credentials>,
    ) -> Result<Initiation, SignalError> {
        if !ctx.is_online {
            return Ok(Initiation::Skipped(SkipReason::Offline));
        }
        if let Some(reason) = self.busy() {
            return Ok(Initiation::Skipped(reason));
        }
        let credentials = credentials
            .or_else(|| ctx.credentials(&self.host))
            .filter(|c| !c.access_token.trim().is_empty());
        let Some(credentials) = credentials else {
            debug!("signal: no access token, initiation skipped");
            return Ok(Initiation::Skipped(SkipReason::MissingAccessToken));
        };
        if let Err(reason) = self.begin() {
            return Ok(Initiation::Skipped(reason));
        }

        match self.run_steps(&credentials, ctx).await {
            Ok(()) => {
                self.finish(SignalState::Ready);
                info!(username = ?credentials.username, "signal: initiated");
                self.publish(Action::SignalInitiated);
                Ok(Initiation::Initiated)
            }
            Err(e) => {
                self.finish(SignalState::Failed);
                warn!(error = %e, code = e.error_code(), "signal: initiation failed");
                Err(e)
            }
        }
    }

    /// Rebuild the chat list and publish it.
    pub async fn refresh_chats(&self, is_online: bool, received: &[PendingMessage]) -> Vec<ChatSummary> {
        let chats = self.service.load_chats(is_online, received).await;
        self.publish(Action::UpdateChats(chats.clone()));
        chats
    }

    /// Publish every chat delivery arriving on `conn`.
    pub fn observe(&self, conn: &Connection) {
        let dispatch = self.dispatch.clone();
        conn.on_message(move |incoming| {
            if let Some(pending) = incoming.pending_message() {
                if dispatch.send(Action::AddWebsocketReceivedMessage(pending)).is_err() {
                    debug!("signal: dispatch closed, delivery not published");
                }
            }
        });
    }

    async fn run_steps(&self, credentials: &Credentials, ctx: &SessionContext) -> Result<(), SignalError> {
        self.service
            .init(credentials)
            .await
            .map_err(|source| SignalError { step: SignalStep::Init, source })?;
        self.service
            .register_account()
            .await
            .map_err(|source| SignalError { step: SignalStep::RegisterAccount, source })?;

        let fcm_token = credentials.fcm_token.as_deref().or(ctx.fcm_token.as_deref());
        if let Some(token) = fcm_token.filter(|t| !t.is_empty()) {
            self.service
                .set_fcm_id(token)
                .await
                .map_err(|source| SignalError { step: SignalStep::SetFcmId, source })?;
        }
        Ok(())
    }

    /// Why a new initiation cannot start now, without changing state.
    fn busy(&self) -> Option<SkipReason> {
        match *self.lock_state() {
            SignalState::Initializing => Some(SkipReason::InProgress),
            SignalState::Ready => Some(SkipReason::AlreadyInitiated),
            SignalState::Uninitialized | SignalState::Failed => None,
        }
    }

    fn begin(&self) -> Result<(), SkipReason> {
        let mut state = self.lock_state();
        match *state {
            SignalState::Uninitialized | SignalState::Failed => {
                *state = SignalState::Initializing;
                Ok(())
            }
            SignalState::Initializing => Err(SkipReason::InProgress),
            SignalState::Ready => Err(SkipReason::AlreadyInitiated),
        }
    }

    fn finish(&self, outcome: SignalState) {
        *self.lock_state() = outcome;
    }

    fn publish(&self, action: Action) {
        if self.dispatch.send(action).is_err() {
            debug!("signal: dispatch closed");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "signal_test.rs"]
mod tests;
