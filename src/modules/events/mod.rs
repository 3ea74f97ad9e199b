//! Engine lifecycle events.
//!
//! Hooks for logging and custom reactions around every attempt of a request
//! chain.

use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::protection::ProtectionKind;

/// Structured pre-request event.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Structured post-response event.
#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RedirectEvent {
    pub from: Url,
    pub to: Url,
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BypassEvent {
    pub url: Url,
    pub protection: ProtectionKind,
    pub strategy: &'static str,
    pub steps: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub domain: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub domain: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    Redirect(RedirectEvent),
    Bypass(BypassEvent),
    Error(ErrorEvent),
    Retry(RetryEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PreRequest(pre) => match &pre.proxy {
                Some(proxy) => log::debug!("-> {} {} via {proxy}", pre.method, pre.url),
                None => log::debug!("-> {} {}", pre.method, pre.url),
            },
            EngineEvent::PostResponse(post) => {
                log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    post.method,
                    post.url,
                    post.status,
                    post.latency.as_secs_f64()
                );
            }
            EngineEvent::Redirect(redirect) => {
                log::debug!(
                    "redirect #{} {} -> {}",
                    redirect.count,
                    redirect.from,
                    redirect.to
                );
            }
            EngineEvent::Bypass(bypass) => {
                log::info!(
                    "{} protection on {}, running {} strategy ({} steps)",
                    bypass.protection,
                    bypass.url,
                    bypass.strategy,
                    bypass.steps
                );
            }
            EngineEvent::Error(error) => {
                log::warn!("warning {} -> {}", error.domain, error.error);
            }
            EngineEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} ({}) after {:.2}s",
                    retry.domain,
                    retry.attempt,
                    retry.reason,
                    retry.scheduled_after.as_secs_f64()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &EngineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(EngineEvent::Error(ErrorEvent {
            domain: "example.com".into(),
            error: "timeout".into(),
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }
}
