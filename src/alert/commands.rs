// =============================================================================
// Command Adapter — the engine's user-facing command surface
// =============================================================================
//
// Thin, transport-agnostic layer the REST API (and any future chat frontend)
// calls into. Every failure maps to a message fit to show the user verbatim.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;

use crate::alert::engine::CompositeEngine;
use crate::alert::leaf::ResolveError;
use crate::alert::parser::{parse_expression, ParseError};

/// User-visible command failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("syntax error: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid condition: {0}")]
    Resolve(#[from] ResolveError),
    #[error("alert not found or you are not subscribed to it")]
    NotSubscribed,
    #[error("the expression must not be empty")]
    EmptyExpression,
}

/// What a user sees about one alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertDescriptor {
    pub alert_id: String,
    pub expression: String,
    pub subscribers_count: usize,
    pub cooldown_sec: u64,
}

/// Commands bound to one engine instance.
#[derive(Clone)]
pub struct AlertCommands {
    engine: Arc<CompositeEngine>,
}

impl AlertCommands {
    pub fn new(engine: Arc<CompositeEngine>) -> Self {
        Self { engine }
    }

    /// Create (or join) the alert for `expression`.
    ///
    /// Nothing is registered when parsing or leaf resolution fails, so a bad
    /// expression can never leave a half-built composite behind.
    pub fn create_alert(
        &self,
        expression: &str,
        user_id: i64,
    ) -> Result<AlertDescriptor, CommandError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(CommandError::EmptyExpression);
        }
        let expr = parse_expression(trimmed)?;
        let alert = self.engine.subscribe(expr, user_id)?;
        Ok(describe(&alert))
    }

    /// Every alert the user is subscribed to.
    pub fn list_alerts(&self, user_id: i64) -> Vec<AlertDescriptor> {
        let mut alerts: Vec<AlertDescriptor> = self
            .engine
            .user_subscriptions(user_id)
            .iter()
            .map(|a| describe(a))
            .collect();
        alerts.sort_by(|a, b| a.alert_id.cmp(&b.alert_id));
        alerts
    }

    /// The system-wide alert inventory.
    pub fn list_all(&self) -> Vec<AlertDescriptor> {
        let mut alerts: Vec<AlertDescriptor> =
            self.engine.all().iter().map(|a| describe(a)).collect();
        alerts.sort_by(|a, b| a.alert_id.cmp(&b.alert_id));
        alerts
    }

    /// Unsubscribe from one alert.
    pub fn unsubscribe(&self, alert_id: &str, user_id: i64) -> Result<(), CommandError> {
        if self.engine.unsubscribe(alert_id, user_id) {
            Ok(())
        } else {
            Err(CommandError::NotSubscribed)
        }
    }

    /// Unsubscribe from everything; returns how many alerts were left.
    pub fn unsubscribe_all(&self, user_id: i64) -> usize {
        self.engine.unsubscribe_all(user_id)
    }

    pub fn engine(&self) -> &Arc<CompositeEngine> {
        &self.engine
    }
}

fn describe(alert: &crate::alert::composite::CompositeAlert) -> AlertDescriptor {
    AlertDescriptor {
        alert_id: alert.id.clone(),
        expression: alert.expression.clone(),
        subscribers_count: alert.subscriber_count(),
        cooldown_sec: alert.cooldown_secs(),
    }
}
