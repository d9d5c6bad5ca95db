//! Result streaming in fetch-size batches.
//!
//! A [`Rows`] either owns an open server cursor, in which case each batch
//! after the first costs one round trip, or holds a result that was read in
//! full and split into batches up front.

use std::collections::VecDeque;
use std::sync::Arc;

use asedb_core::{ColumnInfo, Cx, Error, Row, Value};

use crate::protocol::Column;
use crate::session::Session;

/// An open server cursor.
#[derive(Debug)]
pub(crate) struct Cursor {
    pub(crate) id: i32,
    pub(crate) name: String,
    /// Row format the fetches decode with
    pub(crate) columns: Option<Arc<[Column]>>,
    pub(crate) open: bool,
}

/// Up to fetch-size rows sharing one column layout.
#[derive(Debug, Clone)]
pub struct RowBatch {
    columns: Arc<ColumnInfo>,
    rows: Vec<Row>,
}

impl RowBatch {
    fn new(columns: Arc<ColumnInfo>, values: Vec<Vec<Value>>) -> Self {
        let rows = values
            .into_iter()
            .map(|v| Row::with_columns(Arc::clone(&columns), v))
            .collect();
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &ColumnInfo {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Iterator over the batches of one statement's result.
///
/// Dropping `Rows` with its cursor still open does not block: the cursor is
/// queued and closed at the start of the session's next exchange.
#[derive(Debug)]
pub struct Rows {
    session: Session,
    columns: Arc<[Column]>,
    column_info: Arc<ColumnInfo>,
    pending: VecDeque<RowBatch>,
    cursor: Option<Cursor>,
    current: std::vec::IntoIter<Row>,
    fetch_size: usize,
    rows_affected: Option<u64>,
}

fn column_info(columns: &[Column]) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ))
}

impl Rows {
    /// A result read in full, split into batches of `fetch_size`.
    pub(crate) fn buffered(
        session: Session,
        columns: Option<Arc<[Column]>>,
        values: Vec<Vec<Value>>,
        rows_affected: Option<u64>,
        fetch_size: usize,
    ) -> Self {
        let columns = columns.unwrap_or_else(|| Arc::from(Vec::new()));
        let column_info = column_info(&columns);
        let mut pending = VecDeque::with_capacity(values.len().div_ceil(fetch_size.max(1)));
        let mut values = values.into_iter().peekable();
        while values.peek().is_some() {
            let chunk: Vec<_> = values.by_ref().take(fetch_size.max(1)).collect();
            pending.push_back(RowBatch::new(Arc::clone(&column_info), chunk));
        }
        Self {
            session,
            columns,
            column_info,
            pending,
            cursor: None,
            current: Vec::new().into_iter(),
            fetch_size,
            rows_affected,
        }
    }

    /// A cursor result with its first batch already fetched.
    pub(crate) fn from_cursor(
        session: Session,
        cursor: Cursor,
        first: Vec<Vec<Value>>,
        fetch_size: usize,
    ) -> Self {
        let mut rows = Self::buffered(session, cursor.columns.clone(), Vec::new(), None, fetch_size);
        if !first.is_empty() {
            rows.pending
                .push_back(RowBatch::new(Arc::clone(&rows.column_info), first));
        }
        if cursor.open {
            rows.cursor = Some(cursor);
        }
        rows
    }

    /// Column metadata of the result; empty for statements without rows.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> &[String] {
        self.column_info.names()
    }

    /// Rows affected, for statements that report a count.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    /// Has every row been delivered?
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.cursor.is_none() && self.current.len() == 0
    }

    /// Next batch of rows, or `None` once the result is exhausted.
    ///
    /// Fetches from the server only when no batch is buffered and the
    /// cursor is still open.
    pub fn next_batch(&mut self, cx: &Cx) -> Result<Option<RowBatch>, Error> {
        if let Some(batch) = self.pending.pop_front() {
            return Ok(Some(batch));
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        let values = self.session.fetch_batch(cx, cursor, self.fetch_size)?;
        if let Some(columns) = &cursor.columns {
            if !Arc::ptr_eq(columns, &self.columns) {
                self.columns = Arc::clone(columns);
                self.column_info = column_info(columns);
            }
        }
        if !cursor.open {
            self.cursor = None;
        }
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(RowBatch::new(Arc::clone(&self.column_info), values)))
    }

    /// Next row, fetching batches as needed.
    pub fn next_row(&mut self, cx: &Cx) -> Result<Option<Row>, Error> {
        loop {
            if let Some(row) = self.current.next() {
                return Ok(Some(row));
            }
            match self.next_batch(cx)? {
                Some(batch) => self.current = batch.into_rows().into_iter(),
                None => return Ok(None),
            }
        }
    }

    /// Drain every remaining row.
    pub fn collect_rows(&mut self, cx: &Cx) -> Result<Vec<Row>, Error> {
        let mut out: Vec<Row> = self.current.by_ref().collect();
        while let Some(batch) = self.next_batch(cx)? {
            out.extend(batch.into_rows());
        }
        Ok(out)
    }

    /// Discard undelivered rows and close the cursor, if one is open.
    pub fn close(&mut self, cx: &Cx) -> Result<(), Error> {
        self.pending.clear();
        self.current = Vec::new().into_iter();
        match self.cursor.take() {
            Some(cursor) => self.session.close_cursor(cx, cursor.id),
            None => Ok(()),
        }
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            tracing::debug!(cursor = %cursor.name, id = cursor.id, "Rows dropped with open cursor");
            self.session.queue_orphan(cursor.id);
        }
    }
}
