//! Mock construction helpers

use mockall::mock;
use std::sync::Arc;
use treevis_rs::module::{CodePermission, PermissionDecision, PermissionRequest};

mock! {
    pub Permission {}

    impl CodePermission for Permission {
        fn ask_for_code_permission(&self, request: &PermissionRequest) -> PermissionDecision;
    }
}

/// Permission callback answering `decision` exactly `times` times.
pub fn permission(decision: PermissionDecision, times: usize) -> Arc<dyn CodePermission> {
    let mut mock = MockPermission::new();
    mock.expect_ask_for_code_permission()
        .times(times)
        .return_const(decision);
    Arc::new(mock)
}

/// Permission callback that must never be consulted.
pub fn never_asked() -> Arc<dyn CodePermission> {
    permission(PermissionDecision::Denied, 0)
}

/// Permission callback answering `decision` however often it is asked.
pub fn answering(decision: PermissionDecision) -> Arc<dyn CodePermission> {
    let mut mock = MockPermission::new();
    mock.expect_ask_for_code_permission().return_const(decision);
    Arc::new(mock)
}
