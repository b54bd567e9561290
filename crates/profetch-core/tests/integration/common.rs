use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use profetch_core::{ExtractError, Extractor, FetchError, Fetcher, Record};

/// Fetcher simulating a hostile source: the first `rate_limited_calls`
/// calls get HTTP 429, and targets on a blocked host always get a CAPTCHA.
#[derive(Clone)]
pub struct HostileFetcher {
    calls: Arc<AtomicUsize>,
    rate_limited_calls: usize,
    blocked_host: Option<String>,
}

impl HostileFetcher {
    pub fn rate_limiting_first(calls: usize) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            rate_limited_calls: calls,
            blocked_host: None,
        }
    }

    pub fn blocking_host(host: &str) -> Self {
        Self {
            blocked_host: Some(host.to_string()),
            ..Self::rate_limiting_first(0)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for HostileFetcher {
    async fn fetch(
        &self,
        target: &str,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(host) = &self.blocked_host
            && target.contains(host.as_str())
        {
            return Err(FetchError::Blocked {
                reason: "captcha challenge".into(),
                retry_after: None,
            });
        }
        if call < self.rate_limited_calls {
            return Err(FetchError::HttpStatus {
                code: 429,
                retry_after: None,
            });
        }
        Ok(profile_json(target))
    }
}

pub fn profile_json(target: &str) -> String {
    serde_json::json!({
        "name": "Jane Doe",
        "headline": "Staff Engineer at Acme",
        "location": "Milan, Lombardy, Italy",
        "about": "I build reliable distributed systems and mentor engineers.",
        "experience": [{"title": "Staff Engineer", "company": "Acme"}],
        "education": [{"school": "Politecnico di Milano"}],
        "skills": ["Rust"],
        "url": target,
    })
    .to_string()
}

#[derive(Clone, Default)]
pub struct JsonObjectExtractor;

impl Extractor for JsonObjectExtractor {
    fn extract(&self, raw: &str) -> Result<Record, ExtractError> {
        match serde_json::from_str(raw) {
            Ok(serde_json::Value::Object(record)) => Ok(record),
            Ok(_) => Err(ExtractError::UnexpectedShape("expected object".into())),
            Err(e) => Err(ExtractError::Malformed(e.to_string())),
        }
    }
}
