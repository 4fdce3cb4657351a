//! Start/reply/fork orchestration and the `session` actions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use switchboard_core::AgentLauncher;
use switchboard_core::CoreError;
use switchboard_core::InitCallback;
use switchboard_core::QueryMode;
use switchboard_core::QuerySpec;
use switchboard_core::SessionManager;
use switchboard_core::compute_resume_token;
use switchboard_core::consume_query;
use switchboard_core::verify_resume_token;
use switchboard_protocol::InitMessage;
use switchboard_protocol::PermissionMode;
use switchboard_protocol::SessionConfig;
use switchboard_protocol::SessionStatus;
use switchboard_protocol::SettingSource;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::wire::ReplyRequest;
use crate::wire::SessionAction;
use crate::wire::SessionRequest;
use crate::wire::SessionResponse;
use crate::wire::StartRequest;
use crate::wire::StartResponse;

/// Shared server state: the session manager plus the agent seam.
pub struct ServerState {
    manager: SessionManager,
    launcher: Arc<dyn AgentLauncher>,
}

impl ServerState {
    pub fn new(manager: SessionManager, launcher: Arc<dyn AgentLauncher>) -> Self {
        Self { manager, launcher }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Start a new session. Blocks until the agent's init message assigns a
    /// session id (or the init gate fails).
    pub async fn start(
        &self,
        request: StartRequest,
        request_cancel: Option<CancellationToken>,
    ) -> Result<StartResponse, CoreError> {
        let cwd = request.cwd.clone().unwrap_or_default();
        if cwd.trim().is_empty() {
            return Err(CoreError::InvalidArgument(
                "cwd must be a non-empty string".to_string(),
            ));
        }

        let config = self.finalize_config(build_start_config(&request, cwd))?;
        let permission_timeout = self.permission_timeout(request.permission_request_timeout_ms, &config);

        let cancel = CancellationToken::new();
        let on_init: InitCallback = {
            let manager = self.manager.clone();
            let snapshot = config.clone();
            let cancel = cancel.clone();
            Arc::new(move |init: &InitMessage| {
                manager.create_if_absent(&init.session_id, snapshot.clone(), cancel.clone());
            })
        };

        let spec = QuerySpec {
            mode: QueryMode::Start,
            prompt: request.prompt.clone(),
            config,
            session_id: None,
            fork_session: false,
            wait_for_init: true,
            cancel: cancel.clone(),
            permission_timeout,
            init_timeout: self.manager.runtime_config().session_init_timeout,
            on_init: Some(on_init),
        };
        let mut handle = consume_query(self.manager.clone(), self.launcher.clone(), spec);

        let session_id = match request_cancel {
            Some(request_cancel) => {
                tokio::select! {
                    session_id = handle.session_id() => session_id,
                    _ = request_cancel.cancelled() => {
                        cancel.cancel();
                        Err(CoreError::Cancelled("Request cancelled".to_string()))
                    }
                }
            }
            None => handle.session_id().await,
        }?;

        info!(%session_id, "session started");
        Ok(StartResponse::running(
            session_id.clone(),
            self.resume_token_for(&session_id),
        ))
    }

    /// Reply to an existing session, fork it, or reconstruct it from disk.
    pub async fn reply(&self, request: ReplyRequest) -> Result<StartResponse, CoreError> {
        let session_id = request.session_id.clone();
        if session_id.trim().is_empty() {
            return Err(CoreError::InvalidArgument(
                "sessionId must be a non-empty string".to_string(),
            ));
        }

        match self.manager.status(&session_id) {
            Some(SessionStatus::Running) | Some(SessionStatus::WaitingPermission) => {
                Err(CoreError::SessionBusy(format!(
                    "Session '{session_id}' is busy"
                )))
            }
            Some(SessionStatus::Cancelled) => Err(CoreError::Cancelled(format!(
                "Session '{session_id}' was cancelled"
            ))),
            Some(expected) => self.reply_existing(request, expected).await,
            None => self.disk_resume(request).await,
        }
    }

    async fn reply_existing(
        &self,
        request: ReplyRequest,
        expected: SessionStatus,
    ) -> Result<StartResponse, CoreError> {
        let session_id = request.session_id.clone();
        let cancel = CancellationToken::new();
        // Races with concurrent replies; exactly one acquire wins.
        if self
            .manager
            .try_acquire(&session_id, expected, cancel.clone())
            .is_none()
        {
            return Err(CoreError::SessionBusy(format!(
                "Session '{session_id}' is busy"
            )));
        }
        let config = self
            .manager
            .session_config(&session_id)
            .ok_or_else(|| CoreError::session_not_found(&session_id))?;

        let fork = request.fork_session.unwrap_or(false);
        let permission_timeout =
            self.permission_timeout(request.permission_request_timeout_ms, &config);
        let init_timeout = request
            .session_init_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.manager.runtime_config().session_init_timeout);

        let on_init: Option<InitCallback> = fork.then(|| -> InitCallback {
            let manager = self.manager.clone();
            let snapshot = config.clone();
            let cancel = cancel.clone();
            let original = session_id.clone();
            Arc::new(move |init: &InitMessage| {
                if init.session_id != original {
                    manager.create_if_absent(&init.session_id, snapshot.clone(), cancel.clone());
                }
            })
        });

        let spec = QuerySpec {
            mode: QueryMode::Resume,
            prompt: request.prompt.clone(),
            config,
            session_id: Some(session_id.clone()),
            fork_session: fork,
            wait_for_init: fork,
            cancel,
            permission_timeout,
            init_timeout,
            on_init,
        };
        let mut handle = consume_query(self.manager.clone(), self.launcher.clone(), spec);

        if !fork {
            return Ok(StartResponse::running(
                session_id.clone(),
                self.resume_token_for(&session_id),
            ));
        }

        match handle.session_id().await {
            Ok(new_session_id) if new_session_id != session_id => {
                // The fork branched off; the original goes back to rest.
                self.manager.restore_status(&session_id, expected);
                info!(original = %session_id, forked = %new_session_id, "session forked");
                Ok(StartResponse::running(
                    new_session_id.clone(),
                    self.resume_token_for(&new_session_id),
                ))
            }
            Ok(_) => {
                // The run is torn down before the original is put back, so
                // its abort bookkeeping cannot clobber the restored status.
                handle.close();
                let _ = handle.done.await;
                self.manager.restore_status(&session_id, expected);
                Err(CoreError::Internal(
                    "Fork requested but no new session ID received from agent.".to_string(),
                ))
            }
            Err(err) => {
                let _ = handle.done.await;
                self.manager.restore_status(&session_id, expected);
                Err(err)
            }
        }
    }

    /// Reconstruct a session the server has no record of, trusting only the
    /// agent's transcript store and a valid resume token.
    async fn disk_resume(&self, request: ReplyRequest) -> Result<StartResponse, CoreError> {
        let session_id = request.session_id.clone();
        let runtime = self.manager.runtime_config();
        if !runtime.disk_resume_enabled {
            return Err(CoreError::session_not_found(&session_id));
        }
        let Some(secret) = runtime.resume_secret.clone() else {
            return Err(CoreError::PermissionDenied(
                "Resume token support is not configured".to_string(),
            ));
        };
        let token = request
            .disk_resume_config
            .as_ref()
            .and_then(|c| c.resume_token.clone());
        let Some(token) = token else {
            return Err(CoreError::PermissionDenied(
                "A resume token is required to resume this session".to_string(),
            ));
        };
        if !verify_resume_token(&session_id, &secret, &token) {
            warn!(%session_id, "rejected disk-resume with invalid token");
            return Err(CoreError::PermissionDenied(
                "Invalid resume token".to_string(),
            ));
        }

        // The token only proves knowledge of the session id; the execution
        // context must be supplied by the caller.
        let disk_config = request
            .disk_resume_config
            .map(|c| c.config)
            .unwrap_or_default();
        if disk_config.cwd.trim().is_empty() {
            return Err(CoreError::InvalidArgument(
                "diskResumeConfig.cwd must be a non-empty string".to_string(),
            ));
        }
        let config = self.finalize_config(disk_config)?;
        let permission_timeout =
            self.permission_timeout(request.permission_request_timeout_ms, &config);

        let cancel = CancellationToken::new();
        self.manager
            .create_if_absent(&session_id, config.clone(), cancel.clone());

        let spec = QuerySpec {
            mode: QueryMode::DiskResume,
            prompt: request.prompt.clone(),
            config,
            session_id: Some(session_id.clone()),
            fork_session: false,
            wait_for_init: false,
            cancel,
            permission_timeout,
            init_timeout: request
                .session_init_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(runtime.session_init_timeout),
            on_init: None,
        };
        // Launch errors surface through the session's terminal error event.
        let _handle = consume_query(self.manager.clone(), self.launcher.clone(), spec);

        info!(%session_id, "session reconstructed from disk");
        Ok(StartResponse::running(
            session_id.clone(),
            Some(compute_resume_token(&session_id, &secret)),
        ))
    }

    pub fn session(&self, request: SessionRequest) -> Result<SessionResponse, CoreError> {
        let sensitive = request.include_sensitive.unwrap_or(false)
            && self.manager.runtime_config().allow_sensitive_details;
        match request.action {
            SessionAction::List => Ok(SessionResponse {
                sessions: self.manager.sessions_json(sensitive),
                message: None,
                is_error: None,
            }),
            SessionAction::Get => {
                let session_id = required_session_id(&request)?;
                let session = self
                    .manager
                    .session_json(&session_id, sensitive)
                    .ok_or_else(|| CoreError::session_not_found(&session_id))?;
                Ok(SessionResponse {
                    sessions: vec![session],
                    message: None,
                    is_error: None,
                })
            }
            SessionAction::Cancel => {
                let session_id = required_session_id(&request)?;
                if !self.manager.contains(&session_id) {
                    return Err(CoreError::session_not_found(&session_id));
                }
                if !self
                    .manager
                    .cancel_session(&session_id, None, Some("api".to_string()))
                {
                    let status = self
                        .manager
                        .status(&session_id)
                        .map(|s| s.to_string())
                        .unwrap_or_default();
                    return Err(CoreError::InvalidArgument(format!(
                        "Session '{session_id}' cannot be cancelled from status '{status}'"
                    )));
                }
                let session = self
                    .manager
                    .session_json(&session_id, sensitive)
                    .ok_or_else(|| CoreError::session_not_found(&session_id))?;
                Ok(SessionResponse {
                    sessions: vec![session],
                    message: Some("Session cancelled".to_string()),
                    is_error: None,
                })
            }
        }
    }

    /// Default `settingSources`, layer the caller's env over the process
    /// environment, and enforce the bypass-permissions gate.
    fn finalize_config(&self, mut config: SessionConfig) -> Result<SessionConfig, CoreError> {
        if config.permission_mode == Some(PermissionMode::BypassPermissions)
            && !self.manager.runtime_config().allow_bypass_permissions
        {
            return Err(CoreError::PermissionDenied(
                "Permission mode 'bypassPermissions' is not allowed on this server".to_string(),
            ));
        }
        if config.setting_sources.is_none() {
            config.setting_sources = Some(SettingSource::all());
        }
        if let Some(env) = &config.env {
            let mut merged: BTreeMap<String, String> = std::env::vars().collect();
            merged.extend(env.clone());
            config.env = Some(merged);
        }
        Ok(config)
    }

    fn permission_timeout(&self, override_ms: Option<u64>, config: &SessionConfig) -> Duration {
        override_ms
            .or(config.permission_request_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.manager.runtime_config().permission_request_timeout)
    }

    fn resume_token_for(&self, session_id: &str) -> Option<String> {
        self.manager
            .runtime_config()
            .resume_secret
            .as_ref()
            .map(|secret| compute_resume_token(session_id, secret))
    }
}

/// Overlay the flat start fields onto the `advanced` option set.
fn build_start_config(request: &StartRequest, cwd: String) -> SessionConfig {
    let mut config = request.advanced.clone().unwrap_or_default();
    config.cwd = cwd;
    if !request.allowed_tools.is_empty() {
        config.allowed_tools = request.allowed_tools.clone();
    }
    if !request.disallowed_tools.is_empty() {
        config.disallowed_tools = request.disallowed_tools.clone();
    }
    if let Some(max_turns) = request.max_turns {
        config.max_turns = Some(max_turns);
    }
    if let Some(model) = &request.model {
        config.model = Some(model.clone());
    }
    if let Some(system_prompt) = &request.system_prompt {
        config.system_prompt = Some(system_prompt.clone());
    }
    if let Some(timeout) = request.permission_request_timeout_ms {
        config.permission_request_timeout_ms = Some(timeout);
    }
    config
}

fn required_session_id(request: &SessionRequest) -> Result<String, CoreError> {
    match &request.session_id {
        Some(session_id) if !session_id.trim().is_empty() => Ok(session_id.clone()),
        _ => Err(CoreError::InvalidArgument(
            "sessionId must be a non-empty string".to_string(),
        )),
    }
}
