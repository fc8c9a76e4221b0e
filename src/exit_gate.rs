//! Exit gate: a single-use secret the shutdown path must present.
//!
//! Unlike the access token this value is deliberately readable through
//! [`ExitGate::status`]; it is an operator interlock, not a credential.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use subtle::ConstantTimeEq;

const EXIT_TOKEN_LEN: usize = 8;

#[derive(Debug, Clone)]
struct ExitToken {
    value: String,
    set_at: DateTime<Local>,
}

/// Snapshot returned by the status route.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitGateStatus {
    pub configured: bool,
    pub token: Option<String>,
    pub set_at: Option<String>,
}

#[derive(Default)]
pub struct ExitGate {
    inner: Mutex<Option<ExitToken>>,
}

impl ExitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the gate with a fresh random token, replacing any previous one.
    pub fn set(&self) -> String {
        let value: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(EXIT_TOKEN_LEN)
            .map(char::from)
            .collect();
        *self.inner.lock() = Some(ExitToken {
            value: value.clone(),
            set_at: Local::now(),
        });
        tracing::info!("exit gate armed");
        value
    }

    pub fn clear(&self) {
        if self.inner.lock().take().is_some() {
            tracing::info!("exit gate cleared");
        }
    }

    /// Check `candidate` and, on success, clear the gate in the same step.
    pub fn validate(&self, candidate: &str) -> bool {
        let mut guard = self.inner.lock();
        let matched = guard
            .as_ref()
            .is_some_and(|t| t.value.as_bytes().ct_eq(candidate.as_bytes()).into());
        if matched {
            *guard = None;
            tracing::info!("exit gate token accepted and consumed");
        }
        matched
    }

    /// Decide whether the process may exit. An unarmed gate never blocks.
    pub fn permit_exit(&self, candidate: Option<&str>) -> bool {
        if !self.is_armed() {
            return true;
        }
        candidate.is_some_and(|c| self.validate(c))
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn status(&self) -> ExitGateStatus {
        match self.inner.lock().as_ref() {
            Some(t) => ExitGateStatus {
                configured: true,
                token: Some(t.value.clone()),
                set_at: Some(t.set_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            },
            None => ExitGateStatus {
                configured: false,
                token: None,
                set_at: None,
            },
        }
    }
}
