//! In-memory backend with scriptable failures for the test suite.

use crate::config::DatabaseConfig;
use crate::database::result::CellValue;
use crate::database::traits::{Backend, RawConnection, RawOutcome};
use crate::error::{DatabaseError, DbResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

type Response = (Vec<String>, Vec<Vec<CellValue>>);

struct Script {
    dials: AtomicUsize,
    failing_dials: AtomicUsize,
    refuse_dials: AtomicBool,
    dial_delay: Mutex<Option<Duration>>,
    query_delay: Mutex<Option<Duration>>,
    fail_queries: AtomicBool,
    probe_value: Mutex<CellValue>,
    affected_rows: AtomicU64,
    responses: Mutex<Vec<(String, Response)>>,
    executed: Mutex<Vec<String>>,
    next_thread_id: AtomicU64,
    anonymous: AtomicBool,
    links: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Cloneable handle; clones share one script.
#[derive(Clone)]
pub struct ScriptedBackend {
    script: Arc<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script {
                dials: AtomicUsize::new(0),
                failing_dials: AtomicUsize::new(0),
                refuse_dials: AtomicBool::new(false),
                dial_delay: Mutex::new(None),
                query_delay: Mutex::new(None),
                fail_queries: AtomicBool::new(false),
                probe_value: Mutex::new(CellValue::Int(1)),
                affected_rows: AtomicU64::new(0),
                responses: Mutex::new(Vec::new()),
                executed: Mutex::new(Vec::new()),
                next_thread_id: AtomicU64::new(100),
                anonymous: AtomicBool::new(false),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every dial fails until switched back.
    pub fn refuse_dials(&self, refuse: bool) {
        self.script.refuse_dials.store(refuse, Ordering::SeqCst);
    }

    /// The next `count` dials fail.
    pub fn fail_next_dials(&self, count: usize) {
        self.script.failing_dials.store(count, Ordering::SeqCst);
    }

    /// Delay applied to every dial; a long delay models a hung backend.
    pub fn set_dial_delay(&self, delay: Option<Duration>) {
        *self.script.dial_delay.lock() = delay;
    }

    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *self.script.query_delay.lock() = delay;
    }

    pub fn fail_queries(&self, fail: bool) {
        self.script.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Value answered to `SELECT 1`.
    pub fn set_probe_value(&self, value: CellValue) {
        *self.script.probe_value.lock() = value;
    }

    pub fn set_affected_rows(&self, count: u64) {
        self.script.affected_rows.store(count, Ordering::SeqCst);
    }

    /// Dialed connections report no thread id.
    pub fn hide_thread_ids(&self) {
        self.script.anonymous.store(true, Ordering::SeqCst);
    }

    /// Answers any row-returning statement containing `needle`.
    pub fn respond(&self, needle: &str, columns: &[&str], rows: Vec<Vec<CellValue>>) {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        self.script
            .responses
            .lock()
            .push((needle.to_string(), (columns, rows)));
    }

    /// Drops the transport of every connection dialed so far.
    pub fn sever_all(&self) {
        for link in self.script.links.lock().iter() {
            link.store(true, Ordering::SeqCst);
        }
    }

    pub fn dial_count(&self) -> usize {
        self.script.dials.load(Ordering::SeqCst)
    }

    /// Connections dialed and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.script
            .links
            .lock()
            .iter()
            .filter(|closed| !closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn executed(&self) -> Vec<String> {
        self.script.executed.lock().clone()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn dial(&self, _config: &DatabaseConfig) -> DbResult<Box<dyn RawConnection>> {
        self.script.dials.fetch_add(1, Ordering::SeqCst);

        let delay = *self.script.dial_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scheduled_failure = self
            .script
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure || self.script.refuse_dials.load(Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionFailed(
                "scripted dial failure".into(),
            ));
        }

        let closed = Arc::new(AtomicBool::new(false));
        self.script.links.lock().push(Arc::clone(&closed));
        let thread_id = self.script.next_thread_id.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
            thread_id: (!self.script.anonymous.load(Ordering::SeqCst)).then_some(thread_id),
            closed,
        }))
    }
}

struct ScriptedConnection {
    script: Arc<Script>,
    thread_id: Option<u64>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RawConnection for ScriptedConnection {
    fn thread_id(&self) -> Option<u64> {
        self.thread_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn query(
        &mut self,
        sql: &str,
        _params: &[CellValue],
        fetch_rows: bool,
    ) -> DbResult<RawOutcome> {
        if self.is_closed() {
            return Err(DatabaseError::ConnectionClosed);
        }

        let delay = *self.script.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.fail_queries.load(Ordering::SeqCst) {
            return Err(DatabaseError::QueryFailed("scripted query failure".into()));
        }

        self.script.executed.lock().push(sql.to_string());

        if !fetch_rows {
            return Ok(RawOutcome::Affected(
                self.script.affected_rows.load(Ordering::SeqCst),
            ));
        }

        if sql.trim().eq_ignore_ascii_case("SELECT 1") {
            let value = self.script.probe_value.lock().clone();
            return Ok(RawOutcome::Rows {
                columns: vec!["1".into()],
                rows: vec![vec![value]],
            });
        }

        let responses = self.script.responses.lock();
        let (columns, rows) = responses
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_default();
        Ok(RawOutcome::Rows { columns, rows })
    }

    async fn close(&mut self) -> DbResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
