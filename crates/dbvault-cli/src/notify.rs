//! Notification dispatch.
//!
//! Orchestrators emit one [`Event`] per database run. Routes filter on
//! outcome and hand the event to a transport. Dispatch is detached from
//! the run's cancellation: a cancelled or timed-out backup still reports
//! its failure, and the whole dispatch — every route together — is bounded
//! by a single five-second window. Notification failures are logged, never
//! fatal.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::NotificationConfig;

/// Ceiling for delivering one event across all of its routes.
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one database run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Artifact committed (and retention, if any, succeeded).
    Success,
    /// Anything else.
    Failure,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Failure => write!(f, "failure"),
        }
    }
}

/// The payload shared by every notifier.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Database name.
    pub db: String,
    /// Run outcome.
    pub status: Status,
    /// Bytes written to the store.
    pub bytes: u64,
    /// Final artifact location, when one was opened.
    pub dest: String,
    /// Wall-clock duration, millisecond-rounded.
    pub duration: String,
    /// Error string; empty on success.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Errors from building or running a notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// A route's settings are unusable.
    #[error("{0}")]
    Config(String),

    /// The HTTP request failed.
    #[error("send request: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered outside 2xx.
    #[error("received non-success status: {0}")]
    BadStatus(reqwest::StatusCode),
}

/// A notification transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one event.
    async fn notify(&self, event: &Event) -> Result<(), NotifyError>;
}

struct Route {
    on_success: bool,
    on_failure: bool,
    notifier: Box<dyn Notifier>,
}

impl Route {
    fn wants(&self, status: Status) -> bool {
        match status {
            Status::Success => self.on_success,
            Status::Failure => self.on_failure,
        }
    }
}

/// Fans events out to the configured routes.
pub struct Dispatcher {
    routes: Vec<Route>,
    window: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes.len())
            .field("window", &self.window)
            .finish()
    }
}

impl Dispatcher {
    /// Builds routes from configuration. Unknown transport kinds and
    /// unusable `on` lists are errors.
    pub fn from_config(cfgs: &[NotificationConfig]) -> Result<Self, NotifyError> {
        let mut dispatcher = Self {
            routes: Vec::with_capacity(cfgs.len()),
            window: NOTIFICATION_TIMEOUT,
        };
        for (i, cfg) in cfgs.iter().enumerate() {
            let (on_success, on_failure) = parse_on(&cfg.on)
                .map_err(|e| NotifyError::Config(format!("notifications[{i}]: {e}")))?;
            match cfg.kind.trim().to_lowercase().as_str() {
                "webhook" => {
                    let notifier =
                        WebhookNotifier::new(&cfg.config.url, cfg.config.headers.clone())
                            .map_err(|e| {
                                NotifyError::Config(format!("notifications[{i}] webhook: {e}"))
                            })?;
                    dispatcher.add_route(on_success, on_failure, Box::new(notifier));
                }
                other => {
                    return Err(NotifyError::Config(format!(
                        "notifications[{i}]: unsupported notification type {other:?}"
                    )));
                }
            }
        }
        Ok(dispatcher)
    }

    /// Registers a route directly. Also the seam tests use.
    pub fn add_route(&mut self, on_success: bool, on_failure: bool, notifier: Box<dyn Notifier>) {
        self.routes.push(Route {
            on_success,
            on_failure,
            notifier,
        });
    }

    /// Shrinks the per-route delivery window. Tests only.
    #[cfg(test)]
    pub(crate) fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// True when no routes are configured.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Delivers `event` to every matching route.
    ///
    /// Runs regardless of the caller's cancellation state, bounded by one
    /// shared window for the whole dispatch: when the deadline hits,
    /// undelivered routes are abandoned. Failures are logged and
    /// swallowed.
    pub async fn dispatch(&self, event: &Event) {
        let deliver = async {
            for (i, route) in self.routes.iter().enumerate() {
                if !route.wants(event.status) {
                    continue;
                }
                if let Err(e) = route.notifier.notify(event).await {
                    warn!(route = i, db = %event.db, status = %event.status, error = %e,
                        "notification failed");
                }
            }
        };
        if tokio::time::timeout(self.window, deliver).await.is_err() {
            warn!(db = %event.db, window = ?self.window, "notification dispatch timed out");
        }
    }
}

fn parse_on(raw: &[String]) -> Result<(bool, bool), String> {
    if raw.is_empty() {
        return Err("on must include success, failure, or both".to_string());
    }
    let mut on_success = false;
    let mut on_failure = false;
    for value in raw {
        match value.trim().to_lowercase().as_str() {
            "success" => on_success = true,
            "failure" => on_failure = true,
            "both" => {
                on_success = true;
                on_failure = true;
            }
            other => return Err(format!("on contains unsupported value {other:?}")),
        }
    }
    if !on_success && !on_failure {
        return Err("on must include success, failure, or both".to_string());
    }
    Ok((on_success, on_failure))
}

/// Posts events as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Builds a webhook notifier; the URL is required.
    pub fn new(url: &str, headers: HashMap<String, String>) -> Result<Self, NotifyError> {
        let url = url.trim().to_string();
        if url.is_empty() {
            return Err(NotifyError::Config("config.url is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url,
            headers,
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(event);
        for (k, v) in &self.headers {
            request = request.header(k, v);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::BadStatus(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelReason, CancelToken};
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl Notifier for &'static Recording {
        async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn event(status: Status) -> Event {
        Event {
            db: "orders".to_string(),
            status,
            bytes: 42,
            dest: "/tmp/x".to_string(),
            duration: "1.2s".to_string(),
            error: String::new(),
        }
    }

    fn recorder() -> &'static Recording {
        Box::leak(Box::new(Recording {
            seen: Mutex::new(Vec::new()),
        }))
    }

    #[tokio::test]
    async fn routes_filter_on_status() {
        let rec = recorder();
        let mut d = Dispatcher {
            routes: Vec::new(),
            window: NOTIFICATION_TIMEOUT,
        };
        d.add_route(false, true, Box::new(rec));

        d.dispatch(&event(Status::Success)).await;
        assert!(rec.seen.lock().unwrap().is_empty());

        d.dispatch(&event(Status::Failure)).await;
        assert_eq!(rec.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_survives_cancelled_run() {
        // the event must go out even when the run's token is already
        // cancelled: dispatch never consults it
        let token = CancelToken::new();
        token.cancel(CancelReason::DeadlineExceeded);

        let rec = recorder();
        let mut d = Dispatcher {
            routes: Vec::new(),
            window: NOTIFICATION_TIMEOUT,
        };
        d.add_route(true, true, Box::new(rec));
        d.dispatch(&event(Status::Failure)).await;
        assert_eq!(rec.seen.lock().unwrap().len(), 1);
        assert!(token.is_cancelled());
    }

    struct Stuck;

    #[async_trait]
    impl Notifier for Stuck {
        async fn notify(&self, _event: &Event) -> Result<(), NotifyError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stuck_route_is_bounded_by_window() {
        let mut d = Dispatcher {
            routes: Vec::new(),
            window: NOTIFICATION_TIMEOUT,
        }
        .with_window(Duration::from_millis(30));
        d.add_route(true, true, Box::new(Stuck));

        let started = std::time::Instant::now();
        d.dispatch(&event(Status::Success)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn window_is_shared_across_routes() {
        // one deadline bounds the whole dispatch: N stuck routes must not
        // take N windows
        let mut d = Dispatcher {
            routes: Vec::new(),
            window: NOTIFICATION_TIMEOUT,
        }
        .with_window(Duration::from_millis(50));
        for _ in 0..4 {
            d.add_route(true, true, Box::new(Stuck));
        }

        let started = std::time::Instant::now();
        d.dispatch(&event(Status::Success)).await;
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "dispatch took {:?}, expected one shared window",
            started.elapsed()
        );
    }

    #[test]
    fn parse_on_variants() {
        assert_eq!(parse_on(&["success".into()]).unwrap(), (true, false));
        assert_eq!(parse_on(&["failure".into()]).unwrap(), (false, true));
        assert_eq!(parse_on(&["both".into()]).unwrap(), (true, true));
        assert_eq!(
            parse_on(&["Success".into(), "failure".into()]).unwrap(),
            (true, true)
        );
        assert!(parse_on(&[]).is_err());
        assert!(parse_on(&["sometimes".into()]).is_err());
    }

    #[test]
    fn unsupported_transport_is_config_error() {
        let cfgs = vec![crate::config::NotificationConfig {
            kind: "email".to_string(),
            on: vec!["both".to_string()],
            config: Default::default(),
        }];
        assert!(matches!(
            Dispatcher::from_config(&cfgs).unwrap_err(),
            NotifyError::Config(_)
        ));
    }

    #[test]
    fn webhook_requires_url() {
        assert!(WebhookNotifier::new("   ", HashMap::new()).is_err());
    }

    #[test]
    fn event_serializes_without_empty_error() {
        let json = serde_json::to_string(&event(Status::Success)).unwrap();
        assert!(json.contains("\"status\":\"success\""));
        assert!(!json.contains("\"error\""));

        let mut failed = event(Status::Failure);
        failed.error = "boom".to_string();
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("\"error\":\"boom\""));
    }
}
