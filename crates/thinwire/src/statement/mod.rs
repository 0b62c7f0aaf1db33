//! Statement execution: prepare, bind, execute, fetch and close cycles over
//! server cursors.
//!
//! A [`CursorHandle`] names a statement inside the [`Session`] that created
//! it. The first execute sends the SQL and learns the server cursor id;
//! later executes send only the id. Closing a handle parks the parsed cursor
//! in the session's [`StatementCache`] for the next `prepare` of the same
//! SQL. Cursors the cache cannot keep are closed on the server with the next
//! execute, or in one batch once enough of them pile up.

mod binds;
mod cache;

use std::collections::{HashMap, VecDeque};

use tracing::debug;

pub use self::binds::{BindParams, StatementKind};
pub use self::cache::CacheStatistics;
pub(crate) use self::cache::{CachedCursor, StatementCache};
use crate::codec::{
    BindDescriptor, ColumnInfo, ExecuteOptions, ExecuteRequest, Request, Row, Value,
};
use crate::error::{Error, Result, ServerError};
use crate::session::{CallGuard, Session, SessionIo};

/// Pending cursor closes that force a dedicated close call.
const CLOSE_BATCH: usize = 16;

/// A statement within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle {
    session_id: u64,
    slot: u32,
}

impl CursorHandle {
    /// Id of the owning session.
    #[must_use]
    pub const fn session_id(&self) -> u64 {
        self.session_id
    }
}

/// Outcome of one row of a batched execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    Success { rows_affected: u64 },
    Failed(ServerError),
}

impl RowStatus {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Result of an execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteStatus {
    pub kind: StatementKind,
    /// Affected rows for DML; rows fetched so far for queries.
    pub rows_affected: u64,
    /// One entry per bound row of a batch, in input order. Empty for single
    /// executions.
    pub row_statuses: Vec<RowStatus>,
    /// Result columns of a query.
    pub columns: Vec<ColumnInfo>,
    pub end_of_data: bool,
    /// Server cursor id.
    pub cursor_id: u32,
}

impl ExecuteStatus {
    /// Rows of the batch that failed, with their input index.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &ServerError)> {
        self.row_statuses
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                RowStatus::Failed(e) => Some((i, e)),
                RowStatus::Success { .. } => None,
            })
    }
}

/// Rows returned by one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<Row>,
    /// No more rows follow.
    pub end_of_data: bool,
}

/// A fully fetched query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

#[derive(Debug)]
pub(crate) struct CursorEntry {
    sql: String,
    kind: StatementKind,
    names: Vec<String>,
    rows: Vec<Vec<Value>>,
    batched: bool,
    descriptors: Vec<BindDescriptor>,
    cursor_id: u32,
    columns: Option<Vec<ColumnInfo>>,
    buffered: VecDeque<Row>,
    end_of_data: bool,
    executed: bool,
    prefetch_rows: u32,
}

impl CursorEntry {
    fn new(sql: &str, prefetch_rows: u32, cached: Option<CachedCursor>) -> Self {
        let cached = cached.unwrap_or(CachedCursor {
            cursor_id: 0,
            columns: None,
            binds: Vec::new(),
        });
        Self {
            sql: sql.to_string(),
            kind: StatementKind::classify(sql),
            names: binds::placeholder_names(sql),
            rows: Vec::new(),
            batched: false,
            descriptors: cached.binds,
            cursor_id: cached.cursor_id,
            columns: cached.columns,
            buffered: VecDeque::new(),
            end_of_data: false,
            executed: false,
            prefetch_rows,
        }
    }
}

/// Open statements of one session.
#[derive(Debug, Default)]
pub(crate) struct CursorTable {
    next_slot: u32,
    entries: HashMap<u32, CursorEntry>,
}

impl CursorTable {
    fn insert(&mut self, entry: CursorEntry) -> u32 {
        self.next_slot = self.next_slot.wrapping_add(1);
        while self.entries.contains_key(&self.next_slot) {
            self.next_slot = self.next_slot.wrapping_add(1);
        }
        self.entries.insert(self.next_slot, entry);
        self.next_slot
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn lookup(guard: &CallGuard<'_>, handle: CursorHandle) -> Result<()> {
    if handle.session_id != guard.session_id() {
        return Err(Error::interface(format!(
            "cursor handle belongs to session {}, not {}",
            handle.session_id,
            guard.session_id()
        )));
    }
    if !guard.io.cursors.entries.contains_key(&handle.slot) {
        return Err(Error::interface("cursor handle is closed or unknown"));
    }
    Ok(())
}

/// Run `f` on the handle's entry with the table released, so `f` can make
/// calls through the guard.
fn with_entry<T>(
    guard: &mut CallGuard<'_>,
    handle: CursorHandle,
    f: impl FnOnce(&mut CallGuard<'_>, &mut CursorEntry) -> Result<T>,
) -> Result<T> {
    lookup(guard, handle)?;
    let Some(mut entry) = guard.io.cursors.entries.remove(&handle.slot) else {
        return Err(Error::interface("cursor handle is closed or unknown"));
    };
    let result = f(guard, &mut entry);
    guard.io.cursors.entries.insert(handle.slot, entry);
    result
}

/// Hand a closed statement's server cursor to the cache, queueing whatever
/// the cache rejects for closing.
fn park(io: &mut SessionIo, entry: CursorEntry) {
    if entry.cursor_id == 0 {
        return;
    }
    let cached = CachedCursor {
        cursor_id: entry.cursor_id,
        columns: entry.columns,
        binds: entry.descriptors,
    };
    if let Some(evicted) = io.cache.put(entry.sql, cached) {
        io.pending_close.push(evicted);
    }
}

fn flush_closes(guard: &mut CallGuard<'_>, threshold: usize) -> Result<()> {
    if guard.io.pending_close.is_empty() || guard.io.pending_close.len() < threshold {
        return Ok(());
    }
    let cursor_ids = std::mem::take(&mut guard.io.pending_close);
    debug!(count = cursor_ids.len(), "closing server cursors");
    let request = Request::CloseCursors { cursor_ids };
    match guard.call(&request, None) {
        Ok(_) => Ok(()),
        Err(err) => {
            if unsent(&err)
                && let Request::CloseCursors { cursor_ids } = request
            {
                requeue_closes(guard, cursor_ids);
            }
            Err(err)
        }
    }
}

/// A call failed before its request reached the server.
fn unsent(err: &Error) -> bool {
    !err.is_fatal() && err.server_error().is_none()
}

/// Put close ids taken for a failed request back ahead of any queued since.
fn requeue_closes(guard: &mut CallGuard<'_>, mut cursor_ids: Vec<u32>) {
    cursor_ids.append(&mut guard.io.pending_close);
    guard.io.pending_close = cursor_ids;
}

fn execute_entry(guard: &mut CallGuard<'_>, entry: &mut CursorEntry) -> Result<ExecuteStatus> {
    let width = entry.names.len();
    if width > 0 && entry.rows.is_empty() {
        return Err(Error::interface(format!(
            "statement has {width} bind placeholders but no values are bound"
        )));
    }
    let descriptors = binds::infer_descriptors(&entry.rows, width)?;
    let parse = entry.cursor_id == 0 || descriptors != entry.descriptors;
    let query = entry.kind.returns_rows();

    let mut options = ExecuteOptions::EXECUTE;
    if parse {
        options |= ExecuteOptions::PARSE;
    }
    if query && (parse || entry.columns.is_none()) {
        options |= ExecuteOptions::DESCRIBE;
    }
    if query && entry.prefetch_rows > 0 {
        options |= ExecuteOptions::FETCH;
    }
    if entry.batched {
        options |= ExecuteOptions::BATCH_ERRORS | ExecuteOptions::DML_ROWCOUNTS;
    }
    if guard.options().autocommit && !query {
        options |= ExecuteOptions::COMMIT;
    }

    entry.buffered.clear();
    entry.end_of_data = false;
    entry.executed = false;

    let request = Request::Execute(ExecuteRequest {
        cursor_id: entry.cursor_id,
        sql: parse.then(|| entry.sql.clone()),
        options,
        prefetch_rows: if query { entry.prefetch_rows } else { 0 },
        binds: descriptors.clone(),
        rows: entry.rows.clone(),
        close_cursor_ids: std::mem::take(&mut guard.io.pending_close),
    });
    let columns = if parse { None } else { entry.columns.as_deref() };
    let response = match guard.call(&request, columns) {
        Ok(response) => response,
        Err(err) => {
            if unsent(&err)
                && let Request::Execute(execute) = request
            {
                requeue_closes(guard, execute.close_cursor_ids);
            }
            return Err(err);
        }
    };

    let status = response.status.unwrap_or_default();
    if status.cursor_id != 0 {
        entry.cursor_id = status.cursor_id;
    }
    if response.columns.is_some() {
        entry.columns = response.columns;
    }
    entry.descriptors = descriptors;
    entry.buffered = response.rows.into();
    entry.end_of_data = !query || status.end_of_data;
    entry.executed = true;

    let row_statuses = if entry.batched {
        (0..entry.rows.len())
            .map(|index| {
                response
                    .batch_errors
                    .iter()
                    .find(|e| e.index as usize == index)
                    .map_or_else(
                        || RowStatus::Success {
                            rows_affected: status.row_counts.get(index).copied().unwrap_or(0),
                        },
                        |e| RowStatus::Failed(e.error.clone()),
                    )
            })
            .collect()
    } else {
        Vec::new()
    };

    debug!(
        kind = %entry.kind,
        cursor_id = entry.cursor_id,
        parsed = parse,
        rows = status.row_count,
        prefetched = entry.buffered.len(),
        "statement executed"
    );
    Ok(ExecuteStatus {
        kind: entry.kind,
        rows_affected: status.row_count,
        row_statuses,
        columns: entry.columns.clone().unwrap_or_default(),
        end_of_data: entry.end_of_data,
        cursor_id: entry.cursor_id,
    })
}

fn fetch_entry(
    guard: &mut CallGuard<'_>,
    entry: &mut CursorEntry,
    max_rows: u32,
) -> Result<RowBatch> {
    if !entry.kind.returns_rows() {
        return Err(Error::interface(format!(
            "a {} statement returns no rows",
            entry.kind
        )));
    }
    if !entry.executed {
        return Err(Error::interface("statement must be executed before fetching"));
    }

    let wanted = max_rows as usize;
    let take = wanted.min(entry.buffered.len());
    let mut rows: Vec<Row> = entry.buffered.drain(..take).collect();

    if rows.len() < wanted && !entry.end_of_data {
        let requested = (wanted - rows.len()) as u32;
        let response = guard.call(
            &Request::Fetch {
                cursor_id: entry.cursor_id,
                max_rows: requested,
            },
            entry.columns.as_deref(),
        )?;
        let received = response.rows.len();
        let signaled = response.status.as_ref().is_some_and(|s| s.end_of_data);
        rows.extend(response.rows);
        entry.end_of_data = signaled || received < requested as usize;
    }

    Ok(RowBatch {
        end_of_data: entry.end_of_data && entry.buffered.is_empty(),
        rows,
    })
}

impl Session {
    /// Register a statement. A parsed cursor for the same SQL is taken from
    /// the statement cache when available.
    pub fn prepare(&self, sql: &str) -> Result<CursorHandle> {
        if sql.trim().is_empty() {
            return Err(Error::interface("cannot prepare an empty statement"));
        }
        let mut guard = self.begin()?;
        let cached = guard.io.cache.take(sql);
        let reused = cached.is_some();
        let entry = CursorEntry::new(sql, guard.options().prefetch_rows, cached);
        let slot = guard.io.cursors.insert(entry);
        debug!(session = self.id(), slot, reused, "statement prepared");
        Ok(CursorHandle {
            session_id: self.id(),
            slot,
        })
    }

    /// Bind one set of values, replacing any earlier binds.
    pub fn bind(&self, handle: CursorHandle, params: impl Into<BindParams>) -> Result<()> {
        let params = params.into();
        with_entry(&mut self.begin()?, handle, |_, entry| {
            let values = params.resolve(&entry.names)?;
            entry.rows = if values.is_empty() {
                Vec::new()
            } else {
                vec![values]
            };
            entry.batched = false;
            Ok(())
        })
    }

    /// Bind several sets of values, executed as one batch. Each row gets
    /// its own [`RowStatus`]; a failing row does not abort the rest.
    pub fn bind_batch<I, P>(&self, handle: CursorHandle, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<BindParams>,
    {
        let rows: Vec<BindParams> = rows.into_iter().map(Into::into).collect();
        with_entry(&mut self.begin()?, handle, |_, entry| {
            if rows.is_empty() {
                return Err(Error::interface("a batch needs at least one row"));
            }
            if entry.kind.returns_rows() {
                return Err(Error::interface("queries cannot be executed in batches"));
            }
            entry.rows = rows
                .into_iter()
                .map(|p| p.resolve(&entry.names))
                .collect::<Result<_>>()?;
            entry.batched = true;
            Ok(())
        })
    }

    /// Rows to return with the execute reply of a query; zero defers all
    /// rows to `fetch`.
    pub fn set_prefetch(&self, handle: CursorHandle, rows: u32) -> Result<()> {
        with_entry(&mut self.begin()?, handle, |_, entry| {
            entry.prefetch_rows = rows;
            Ok(())
        })
    }

    /// Execute with the current binds.
    pub fn execute(&self, handle: CursorHandle) -> Result<ExecuteStatus> {
        with_entry(&mut self.begin()?, handle, execute_entry)
    }

    /// Next rows of an executed query. An empty batch with `end_of_data`
    /// is returned once the cursor is exhausted.
    ///
    /// # Errors
    ///
    /// `Interface` for a zero `max_rows`, a non-query or an unexecuted
    /// statement.
    pub fn fetch(&self, handle: CursorHandle, max_rows: u32) -> Result<RowBatch> {
        if max_rows == 0 {
            return Err(Error::interface("max_rows must be at least 1"));
        }
        with_entry(&mut self.begin()?, handle, |guard, entry| {
            fetch_entry(guard, entry, max_rows)
        })
    }

    /// Result columns; empty until a query has been described.
    pub fn columns(&self, handle: CursorHandle) -> Result<Vec<ColumnInfo>> {
        with_entry(&mut self.begin()?, handle, |_, entry| {
            Ok(entry.columns.clone().unwrap_or_default())
        })
    }

    /// Release the handle. Its server cursor goes to the statement cache.
    pub fn close_cursor(&self, handle: CursorHandle) -> Result<()> {
        let mut guard = self.begin()?;
        lookup(&guard, handle)?;
        if let Some(entry) = guard.io.cursors.entries.remove(&handle.slot) {
            park(&mut guard.io, entry);
        }
        flush_closes(&mut guard, CLOSE_BATCH)
    }

    /// Release every open handle, as on return to a pool. Parsed cursors stay
    /// in the statement cache.
    pub fn close_all_cursors(&self) -> Result<()> {
        let mut guard = self.begin()?;
        let io = &mut *guard.io;
        let entries: Vec<CursorEntry> = io.cursors.entries.drain().map(|(_, e)| e).collect();
        for entry in entries {
            park(io, entry);
        }
        flush_closes(&mut guard, CLOSE_BATCH)
    }

    /// Number of open cursor handles.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.io_snapshot(|io| io.cursors.len())
    }

    #[must_use]
    pub fn cache_statistics(&self) -> CacheStatistics {
        self.io_snapshot(|io| io.cache.statistics())
    }

    /// Prepare, execute and fetch every row of a query, then close it.
    pub fn query(&self, sql: &str, params: impl Into<BindParams>) -> Result<RowSet> {
        let handle = self.prepare(sql)?;
        let result = self.query_handle(handle, params.into());
        let closed = self.close_cursor(handle);
        let rows = result?;
        closed?;
        Ok(rows)
    }

    fn query_handle(&self, handle: CursorHandle, params: BindParams) -> Result<RowSet> {
        self.bind(handle, params)?;
        let status = self.execute(handle)?;
        let mut set = RowSet {
            columns: status.columns,
            rows: Vec::new(),
        };
        if !status.kind.returns_rows() {
            return Ok(set);
        }
        let batch_size = self.options().prefetch_rows.max(1);
        loop {
            let batch = self.fetch(handle, batch_size)?;
            set.rows.extend(batch.rows);
            if batch.end_of_data {
                return Ok(set);
            }
        }
    }

    /// Prepare and execute one statement, then close it.
    pub fn execute_sql(&self, sql: &str, params: impl Into<BindParams>) -> Result<ExecuteStatus> {
        let handle = self.prepare(sql)?;
        let result = self
            .bind(handle, params)
            .and_then(|()| self.execute(handle));
        let closed = self.close_cursor(handle);
        let status = result?;
        closed?;
        Ok(status)
    }

    /// Prepare and execute one statement with a batch of binds, then close
    /// it.
    pub fn execute_batch<I, P>(&self, sql: &str, rows: I) -> Result<ExecuteStatus>
    where
        I: IntoIterator<Item = P>,
        P: Into<BindParams>,
    {
        let handle = self.prepare(sql)?;
        let result = self
            .bind_batch(handle, rows)
            .and_then(|()| self.execute(handle));
        let closed = self.close_cursor(handle);
        let status = result?;
        closed?;
        Ok(status)
    }
}
