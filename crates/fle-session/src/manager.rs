//! Thread-safe in-memory session registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fle_core::code::{is_valid_session_code, normalize_session_code};
use fle_core::metrics::{SESSIONS_CREATED_TOTAL, SESSIONS_EXPIRED_TOTAL};

use crate::generator::CodeGenerator;
use crate::types::{Session, SessionError, SessionOptions};

/// Default period of the background expiry sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct Inner {
    sessions: RwLock<HashMap<String, Session>>,
    generator: CodeGenerator,
    options: SessionOptions,
}

/// Handle on the background sweep: the token signals stop, the join
/// handle acknowledges it.
struct Sweeper {
    stop: CancellationToken,
    done: JoinHandle<()>,
}

/// Session registry.
///
/// Lookups take the write lock because they bump `last_accessed`; count and
/// list take the read lock. Must be constructed inside a Tokio runtime, which
/// hosts the expiry sweep.
pub struct SessionManager {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionManager {
    /// Registry with the default sweep interval.
    pub fn new(options: SessionOptions) -> Self {
        Self::with_cleanup_interval(options, DEFAULT_CLEANUP_INTERVAL)
    }

    /// Registry sweeping expired sessions every `interval`.
    pub fn with_cleanup_interval(options: SessionOptions, interval: Duration) -> Self {
        Self::with_generator(options, interval, CodeGenerator::new())
    }

    /// Registry with an explicit code generator.
    pub fn with_generator(
        options: SessionOptions,
        interval: Duration,
        generator: CodeGenerator,
    ) -> Self {
        let inner = Arc::new(Inner {
            sessions: RwLock::new(HashMap::new()),
            generator,
            options,
        });

        let stop = CancellationToken::new();
        let done = tokio::spawn(run_sweeper(Arc::clone(&inner), interval, stop.clone()));

        Self {
            inner,
            sweeper: Mutex::new(Some(Sweeper { stop, done })),
        }
    }

    /// Options the registry was built with.
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Mint and store a session under a fresh code.
    ///
    /// Makes up to `max_retries + 1` attempts. `cancel` is consulted only
    /// after a collision, never before the first attempt. `options` falls
    /// back to the registry's own.
    pub fn create_session(
        &self,
        cancel: &CancellationToken,
        options: Option<&SessionOptions>,
    ) -> Result<Session, SessionError> {
        let options = options.unwrap_or(&self.inner.options);
        let attempts = options.max_retries.saturating_add(1);

        for attempt in 0..attempts {
            if attempt > 0 && cancel.is_cancelled() {
                debug!(attempt, "session creation cancelled");
                return Err(SessionError::Cancelled);
            }

            let candidate = self.inner.generator.generate();
            if !is_valid_session_code(&candidate) {
                continue;
            }
            let code = normalize_session_code(&candidate);

            let now = Utc::now();
            let mut sessions = self.inner.sessions.write();
            let occupied = sessions
                .get(&code)
                .is_some_and(|s| !s.is_expired_at(now, self.inner.options.timeout));
            if occupied {
                debug!(code, attempt, "session code collision");
                continue;
            }

            let session = Session {
                code: code.clone(),
                created_at: now,
                last_accessed: now,
                data: options.initial_data.clone(),
            };
            let _ = sessions.insert(code.clone(), session.clone());
            drop(sessions);

            counter!(SESSIONS_CREATED_TOTAL).increment(1);
            debug!(code, attempt, "session created");
            return Ok(session);
        }

        Err(SessionError::CodeGenerationFailed { attempts })
    }

    /// Look up a session, bumping its `last_accessed`.
    ///
    /// An expired session is removed and reported as [`SessionError::Expired`].
    pub fn get_session(&self, code: &str) -> Result<Session, SessionError> {
        let code = checked_code(code)?;
        let now = Utc::now();

        let mut sessions = self.inner.sessions.write();
        let session = sessions.get_mut(&code).ok_or(SessionError::NotFound)?;
        if session.is_expired_at(now, self.inner.options.timeout) {
            let _ = sessions.remove(&code);
            counter!(SESSIONS_EXPIRED_TOTAL).increment(1);
            debug!(code, "session expired on lookup");
            return Err(SessionError::Expired);
        }
        session.last_accessed = now;
        Ok(session.clone())
    }

    /// Remove a session. Returns whether one was stored.
    pub fn delete_session(&self, code: &str) -> bool {
        let Ok(code) = checked_code(code) else {
            return false;
        };
        self.inner.sessions.write().remove(&code).is_some()
    }

    /// Merge `patch` into a session's data, bumping `last_accessed`.
    pub fn update_session_data(
        &self,
        code: &str,
        patch: HashMap<String, Value>,
    ) -> Result<(), SessionError> {
        let code = checked_code(code)?;
        let now = Utc::now();

        let mut sessions = self.inner.sessions.write();
        let session = sessions.get_mut(&code).ok_or(SessionError::NotFound)?;
        if session.is_expired_at(now, self.inner.options.timeout) {
            let _ = sessions.remove(&code);
            counter!(SESSIONS_EXPIRED_TOTAL).increment(1);
            return Err(SessionError::Expired);
        }
        session.data.extend(patch);
        session.last_accessed = now;
        Ok(())
    }

    /// Number of stored sessions, expired-but-unswept included.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Sorted snapshot of stored codes.
    pub fn list_sessions(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Remove every expired session. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Stop the background sweep and wait for it to exit.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn close(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { stop, done }) = sweeper {
            stop.cancel();
            let _ = done.await;
            info!("session sweeper stopped");
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.sweeper.lock().is_none()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.stop.cancel();
        }
    }
}

impl Inner {
    fn cleanup(&self) -> usize {
        let now = Utc::now();
        let timeout = self.options.timeout;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now, timeout));
        let removed = before - sessions.len();
        if removed > 0 {
            counter!(SESSIONS_EXPIRED_TOTAL).increment(removed as u64);
        }
        removed
    }
}

fn checked_code(code: &str) -> Result<String, SessionError> {
    if is_valid_session_code(code) {
        Ok(normalize_session_code(code))
    } else {
        Err(SessionError::InvalidCode)
    }
}

async fn run_sweeper(inner: Arc<Inner>, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let removed = inner.cleanup();
                if removed > 0 {
                    info!(removed, "expired sessions swept");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(SessionOptions::default())
    }

    fn short_lived(timeout: Duration) -> SessionManager {
        SessionManager::new(SessionOptions {
            timeout,
            ..SessionOptions::default()
        })
    }

    /// Store a session whose last access is `ago` in the past.
    fn insert_aged(m: &SessionManager, code: &str, ago: chrono::TimeDelta) {
        let at = Utc::now() - ago;
        let _ = m.inner.sessions.write().insert(
            code.to_string(),
            Session {
                code: code.to_string(),
                created_at: at,
                last_accessed: at,
                data: HashMap::new(),
            },
        );
    }

    // ── create ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_stores_normalized_session() {
        let m = manager();
        let s = m.create_session(&CancellationToken::new(), None).unwrap();
        assert!(is_valid_session_code(&s.code));
        assert_eq!(s.code, s.code.to_lowercase());
        assert_eq!(s.created_at, s.last_accessed);
        assert_eq!(m.session_count(), 1);
        assert_eq!(m.list_sessions(), vec![s.code.clone()]);
    }

    #[tokio::test]
    async fn create_copies_initial_data() {
        let m = manager();
        let mut opts = SessionOptions::default();
        let _ = opts.initial_data.insert("lang".into(), json!("en"));
        let s = m.create_session(&CancellationToken::new(), Some(&opts)).unwrap();
        assert_eq!(s.data["lang"], "en");

        opts.initial_data.clear();
        let again = m.get_session(&s.code).unwrap();
        assert_eq!(again.data["lang"], "en");
    }

    #[tokio::test]
    async fn concurrent_creates_yield_distinct_codes() {
        let m = Arc::new(manager());
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let m = Arc::clone(&m);
                tokio::spawn(async move { m.create_session(&CancellationToken::new(), None) })
            })
            .collect();

        let mut codes = HashSet::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(s) => assert!(codes.insert(s.code)),
                Err(e) => assert_matches!(e, SessionError::CodeGenerationFailed { .. }),
            }
        }
        assert_eq!(m.session_count(), codes.len());
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        // Same seed twice: the second registry's first candidate collides.
        let probe = CodeGenerator::from_seed(42);
        let first = probe.generate();

        let m = SessionManager::with_generator(
            SessionOptions { max_retries: 0, ..SessionOptions::default() },
            DEFAULT_CLEANUP_INTERVAL,
            CodeGenerator::from_seed(42),
        );
        insert_aged(&m, &first, chrono::TimeDelta::zero());

        let err = m.create_session(&CancellationToken::new(), None).unwrap_err();
        assert_eq!(err, SessionError::CodeGenerationFailed { attempts: 1 });
        assert_eq!(m.session_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_checked_only_after_collision() {
        let probe = CodeGenerator::from_seed(9);
        let first = probe.generate();
        let second = probe.generate();

        let cancelled = CancellationToken::new();
        cancelled.cancel();

        // First attempt succeeds even with an already-cancelled token.
        let m = SessionManager::with_generator(
            SessionOptions::default(),
            DEFAULT_CLEANUP_INTERVAL,
            CodeGenerator::from_seed(9),
        );
        let s = m.create_session(&cancelled, None).unwrap();
        assert_eq!(s.code, first);

        // After a collision the token is honored.
        let m = SessionManager::with_generator(
            SessionOptions::default(),
            DEFAULT_CLEANUP_INTERVAL,
            CodeGenerator::from_seed(9),
        );
        insert_aged(&m, &first, chrono::TimeDelta::zero());
        assert_eq!(m.create_session(&cancelled, None), Err(SessionError::Cancelled));
        assert!(!m.list_sessions().contains(&second));
    }

    #[tokio::test]
    async fn expired_holder_does_not_block_code() {
        let first = CodeGenerator::from_seed(5).generate();
        let m = SessionManager::with_generator(
            SessionOptions {
                max_retries: 0,
                timeout: Duration::from_secs(60),
                ..SessionOptions::default()
            },
            DEFAULT_CLEANUP_INTERVAL,
            CodeGenerator::from_seed(5),
        );
        insert_aged(&m, &first, chrono::TimeDelta::minutes(5));

        let s = m.create_session(&CancellationToken::new(), None).unwrap();
        assert_eq!(s.code, first);
        assert!(m.get_session(&first).is_ok());
    }

    // ── get ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn get_is_case_insensitive_and_bumps_access() {
        let m = manager();
        let s = m.create_session(&CancellationToken::new(), None).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let found = m.get_session(&format!("  {}  ", s.code.to_uppercase())).unwrap();
        assert_eq!(found.code, s.code);
        assert!(found.last_accessed > s.last_accessed);
    }

    #[tokio::test]
    async fn get_rejects_malformed_codes() {
        let m = manager();
        for code in ["", "happy-panda", "happy-panda-100", "x-y-z"] {
            assert_eq!(m.get_session(code), Err(SessionError::InvalidCode), "{code}");
        }
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let m = manager();
        assert_eq!(m.get_session("happy-panda-42"), Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn expired_session_unreachable_and_removed() {
        let m = short_lived(Duration::from_secs(60));
        insert_aged(&m, "old-owl-3", chrono::TimeDelta::minutes(2));

        assert_eq!(m.get_session("old-owl-3"), Err(SessionError::Expired));
        assert_eq!(m.session_count(), 0);
        assert_eq!(m.get_session("old-owl-3"), Err(SessionError::NotFound));
    }

    // ── delete / update ─────────────────────────────────────────────

    #[tokio::test]
    async fn delete_reports_presence() {
        let m = manager();
        let s = m.create_session(&CancellationToken::new(), None).unwrap();
        assert!(m.delete_session(&s.code.to_uppercase()));
        assert!(!m.delete_session(&s.code));
        assert!(!m.delete_session("not a code"));
        assert_eq!(m.session_count(), 0);
    }

    #[tokio::test]
    async fn update_merges_keys() {
        let m = manager();
        let mut opts = SessionOptions::default();
        let _ = opts.initial_data.insert("a".into(), json!(1));
        let _ = opts.initial_data.insert("b".into(), json!(2));
        let s = m.create_session(&CancellationToken::new(), Some(&opts)).unwrap();

        let patch = HashMap::from([("b".to_string(), json!(20)), ("c".to_string(), json!(30))]);
        m.update_session_data(&s.code, patch).unwrap();

        let data = m.get_session(&s.code).unwrap().data;
        assert_eq!(data["a"], 1);
        assert_eq!(data["b"], 20);
        assert_eq!(data["c"], 30);
    }

    #[tokio::test]
    async fn update_checks_format_presence_and_expiry() {
        let m = short_lived(Duration::from_secs(60));
        assert_eq!(
            m.update_session_data("bogus", HashMap::new()),
            Err(SessionError::InvalidCode)
        );
        assert_eq!(
            m.update_session_data("calm-fox-1", HashMap::new()),
            Err(SessionError::NotFound)
        );
        insert_aged(&m, "calm-fox-1", chrono::TimeDelta::minutes(2));
        assert_eq!(
            m.update_session_data("calm-fox-1", HashMap::new()),
            Err(SessionError::Expired)
        );
        assert_eq!(m.session_count(), 0);
    }

    // ── cleanup / close ─────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_removes_only_expired() {
        let m = short_lived(Duration::from_secs(60));
        insert_aged(&m, "old-owl-1", chrono::TimeDelta::minutes(2));
        insert_aged(&m, "old-owl-2", chrono::TimeDelta::minutes(3));
        insert_aged(&m, "new-owl-1", chrono::TimeDelta::seconds(1));

        assert_eq!(m.cleanup(), 2);
        assert_eq!(m.list_sessions(), vec!["new-owl-1".to_string()]);
        assert_eq!(m.cleanup(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_removes_expired() {
        let m = SessionManager::with_cleanup_interval(
            SessionOptions { timeout: Duration::from_secs(60), ..SessionOptions::default() },
            Duration::from_secs(5),
        );
        insert_aged(&m, "old-owl-1", chrono::TimeDelta::minutes(2));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(m.session_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let m = manager();
        assert!(!m.is_closed());
        m.close().await;
        assert!(m.is_closed());
        m.close().await;

        // The store stays usable for direct calls after close.
        let s = m.create_session(&CancellationToken::new(), None).unwrap();
        assert!(m.get_session(&s.code).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_sweeper_stops_sweeping() {
        let m = SessionManager::with_cleanup_interval(
            SessionOptions { timeout: Duration::from_secs(60), ..SessionOptions::default() },
            Duration::from_secs(5),
        );
        m.close().await;
        insert_aged(&m, "old-owl-1", chrono::TimeDelta::minutes(2));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(m.session_count(), 1);
    }
}
