//! Human-in-the-loop authorization for unverified code.
//!
//! When neither the first-party keys nor the trusted key ring verify a
//! signature, the loader asks a [`CodePermission`] implementation. Answers are
//! memoised per [`PermissionSession`], keyed by signer fingerprint when the
//! code verifies against the key it names, and by the code itself otherwise.

use super::crypto::PublicKeyRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Denied,
    Granted,
    /// Granted, and the signer's key should be added to the trusted ring
    GrantedAndTrusted,
}

impl PermissionDecision {
    pub fn is_granted(self) -> bool {
        !matches!(self, PermissionDecision::Denied)
    }
}

/// What is being asked about.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    /// Module name, or a description such as "pipeline formatters"
    pub subject: String,
    pub module_id: Option<Uuid>,
    /// Key that verifiably signed the code but is not trusted yet
    pub public_key: Option<PublicKeyRecord>,
    /// [`short_digest`](super::crypto::short_digest) of the code asked about
    pub code_digest: String,
    /// Why verification failed
    pub reason: String,
}

impl PermissionRequest {
    fn memo_key(&self) -> String {
        match (&self.public_key, self.module_id) {
            (Some(key), _) => format!("key:{}", key.fingerprint()),
            (None, Some(id)) => format!("module:{}:{}", id, self.code_digest),
            (None, None) => format!("subject:{}:{}", self.subject, self.code_digest),
        }
    }
}

/// Callback deciding whether unverified code may be compiled and run.
#[cfg_attr(test, mockall::automock)]
pub trait CodePermission: Send + Sync {
    fn ask_for_code_permission(&self, request: &PermissionRequest) -> PermissionDecision;
}

/// Refuses everything. Used when no interactive host is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl CodePermission for DenyAll {
    fn ask_for_code_permission(&self, request: &PermissionRequest) -> PermissionDecision {
        tracing::warn!("Denied code permission for {}: {}", request.subject, request.reason);
        PermissionDecision::Denied
    }
}

/// Grants everything without trusting keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CodePermission for AllowAll {
    fn ask_for_code_permission(&self, request: &PermissionRequest) -> PermissionDecision {
        tracing::warn!("Granting code permission for {} without verification", request.subject);
        PermissionDecision::Granted
    }
}

/// Memoising wrapper around a [`CodePermission`] for one load session.
pub struct PermissionSession {
    callback: Arc<dyn CodePermission>,
    decisions: Mutex<HashMap<String, PermissionDecision>>,
}

impl PermissionSession {
    pub fn new(callback: Arc<dyn CodePermission>) -> Self {
        Self {
            callback,
            decisions: Mutex::new(HashMap::new()),
        }
    }

    /// Ask once per signer (or module); repeated requests reuse the answer.
    pub fn ask(&self, request: &PermissionRequest) -> PermissionDecision {
        let key = request.memo_key();
        if let Some(decision) = self.decisions.lock().get(&key) {
            tracing::trace!("Reusing permission decision {:?} for {}", decision, key);
            return *decision;
        }
        let decision = self.callback.ask_for_code_permission(request);
        tracing::debug!("Permission for {} ({}): {:?}", request.subject, key, decision);
        self.decisions.lock().insert(key, decision);
        decision
    }

    /// Forget every memoised decision.
    pub fn reset(&self) {
        self.decisions.lock().clear();
    }
}

impl std::fmt::Debug for PermissionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionSession")
            .field("decisions", &self.decisions.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::crypto::test_keys;

    fn request(module_id: Uuid, key: Option<PublicKeyRecord>) -> PermissionRequest {
        PermissionRequest {
            subject: "Test module".to_string(),
            module_id: Some(module_id),
            public_key: key,
            code_digest: "c0de".to_string(),
            reason: "unsigned".to_string(),
        }
    }

    #[test]
    fn test_session_memoises_by_module() {
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission()
            .times(1)
            .returning(|_| PermissionDecision::Granted);
        let session = PermissionSession::new(Arc::new(mock));

        let id = Uuid::new_v4();
        assert_eq!(session.ask(&request(id, None)), PermissionDecision::Granted);
        assert_eq!(session.ask(&request(id, None)), PermissionDecision::Granted);
    }

    #[test]
    fn test_session_memoises_by_key_across_modules() {
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission()
            .times(1)
            .returning(|_| PermissionDecision::Denied);
        let session = PermissionSession::new(Arc::new(mock));

        let key = test_keys::pair(0).public.clone();
        assert!(!session.ask(&request(Uuid::new_v4(), Some(key.clone()))).is_granted());
        assert!(!session.ask(&request(Uuid::new_v4(), Some(key))).is_granted());
    }

    #[test]
    fn test_changed_code_asks_again() {
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission()
            .times(2)
            .returning(|_| PermissionDecision::Granted);
        let session = PermissionSession::new(Arc::new(mock));

        let id = Uuid::new_v4();
        let mut edited = request(id, None);
        edited.code_digest = "beef".to_string();
        session.ask(&request(id, None));
        session.ask(&edited);
    }

    #[test]
    fn test_reset_asks_again() {
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission()
            .times(2)
            .returning(|_| PermissionDecision::Granted);
        let session = PermissionSession::new(Arc::new(mock));
        let id = Uuid::new_v4();
        session.ask(&request(id, None));
        session.reset();
        session.ask(&request(id, None));
    }
}
