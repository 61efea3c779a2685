// ABOUTME: Authenticated session bound to one target system.
// ABOUTME: Only the orchestrator can create one, after credential and system checks.

use crate::auth::Principal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    principal: Principal,
    system: String,
}

impl Session {
    pub(crate) fn new(principal: Principal, system: &str) -> Self {
        Self {
            principal,
            system: system.to_string(),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn user(&self) -> &str {
        &self.principal.user
    }

    pub fn system(&self) -> &str {
        &self.system
    }
}
