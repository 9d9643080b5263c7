//! The surface a host database binds to.
//!
//! [`Extension`] owns one [`Session`] and the chat store. Scalar functions
//! are dispatched by name through [`Extension::call`]; table-valued sources
//! (`llm_chat`, `ai_log`, `ai_chat_history`, `ai_chat_messages`) are opened
//! with [`Extension::open_table`] and yield rows of [`Value`]s.

pub mod functions;
pub mod value;

use std::sync::Arc;
use std::vec;

use tracing::debug;

use crate::chat::store::{HISTORY_TABLE, MESSAGES_TABLE};
use crate::chat::{ChatStore, ChatStream, MemoryChatStore};
use crate::engine::Backend;
use crate::error::{Error, Result};
use crate::session::Session;

pub use functions::{Function, FUNCTIONS};
pub use value::{Value, ValueType};

pub const CHAT_TABLE: &str = "llm_chat";
pub const LOG_TABLE: &str = "ai_log";

const SQL_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// One database connection's worth of state.
pub struct Extension {
    session: Session,
    store: Box<dyn ChatStore>,
}

impl Extension {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_store(backend, Box::new(MemoryChatStore::new()))
    }

    pub fn with_store(backend: Arc<dyn Backend>, store: Box<dyn ChatStore>) -> Self {
        Self {
            session: Session::new(backend),
            store,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn store(&self) -> &dyn ChatStore {
        self.store.as_ref()
    }

    /// Names of all scalar functions and table sources.
    pub fn function_names() -> impl Iterator<Item = &'static str> {
        FUNCTIONS
            .iter()
            .map(|f| f.name)
            .chain([CHAT_TABLE, LOG_TABLE, HISTORY_TABLE, MESSAGES_TABLE])
    }

    /// Invokes scalar function `name` with `args`.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let Some(function) = functions::lookup(name) else {
            if name.eq_ignore_ascii_case(CHAT_TABLE) {
                return Err(Error::InvalidArgument(format!(
                    "'{}' is a table-valued function. Use it in a FROM clause.",
                    CHAT_TABLE
                )));
            }
            return Err(Error::InvalidArgument(format!("no such function: {}", name)));
        };
        debug!(function = function.name, args = args.len(), "call");
        function.invoke(self, args)
    }

    /// Opens table source `name`.
    pub fn open_table(&mut self, name: &str, args: &[Value]) -> Result<TableCursor<'_>> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            CHAT_TABLE => {
                functions::check_args(CHAT_TABLE, &[&[ValueType::Text]], args)?;
                let text = args.first().and_then(Value::as_text).unwrap_or_default();
                Ok(TableCursor::Chat(self.session.chat_stream(text)?))
            }
            LOG_TABLE => {
                no_args(LOG_TABLE, args)?;
                let rows = self
                    .session
                    .log()
                    .entries()
                    .into_iter()
                    .map(|e| {
                        vec![
                            Value::Text(e.timestamp.format(SQL_DATETIME).to_string()),
                            Value::from(e.level.as_str()),
                            Value::Text(e.text),
                        ]
                    })
                    .collect();
                Ok(TableCursor::rows(LOG_TABLE, rows))
            }
            HISTORY_TABLE => {
                no_args(HISTORY_TABLE, args)?;
                let rows = self
                    .store
                    .conversations()
                    .into_iter()
                    .map(|c| {
                        vec![
                            Value::Integer(c.id),
                            Value::Text(c.uuid.to_string()),
                            Value::from(c.title),
                            Value::from(c.metadata),
                            Value::Text(c.created_at.format(SQL_DATETIME).to_string()),
                        ]
                    })
                    .collect();
                Ok(TableCursor::rows(HISTORY_TABLE, rows))
            }
            MESSAGES_TABLE => {
                no_args(MESSAGES_TABLE, args)?;
                let rows = self
                    .store
                    .messages()
                    .into_iter()
                    .map(|m| {
                        vec![
                            Value::Integer(m.id),
                            Value::Integer(m.chat_id),
                            Value::from(m.role.as_str()),
                            Value::Text(m.content),
                            Value::Text(m.created_at.format(SQL_DATETIME).to_string()),
                        ]
                    })
                    .collect();
                Ok(TableCursor::rows(MESSAGES_TABLE, rows))
            }
            _ => Err(Error::InvalidArgument(format!("no such table: {}", name))),
        }
    }
}

fn no_args(name: &str, args: &[Value]) -> Result<()> {
    functions::check_args(name, &[&[]], args)
}

/// Column names of a table source.
pub fn columns(table: &str) -> Option<&'static [&'static str]> {
    match table.to_ascii_lowercase().as_str() {
        CHAT_TABLE => Some(&["reply"]),
        LOG_TABLE => Some(&["timestamp", "level", "text"]),
        HISTORY_TABLE => Some(&["id", "uuid", "title", "metadata", "created_at"]),
        MESSAGES_TABLE => Some(&["id", "chat_id", "role", "content", "created_at"]),
        _ => None,
    }
}

/// Row cursor over a table source.
///
/// The chat cursor generates as it is advanced and records the reply when
/// it is dropped; the others are snapshots taken when the cursor opened.
pub enum TableCursor<'a> {
    Chat(ChatStream<'a>),
    Rows {
        table: &'static str,
        rows: vec::IntoIter<Vec<Value>>,
    },
}

impl TableCursor<'_> {
    fn rows(table: &'static str, rows: Vec<Vec<Value>>) -> Self {
        TableCursor::Rows {
            table,
            rows: rows.into_iter(),
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            TableCursor::Chat(_) => CHAT_TABLE,
            TableCursor::Rows { table, .. } => *table,
        }
    }
}

impl Iterator for TableCursor<'_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            TableCursor::Chat(stream) => stream
                .next()
                .map(|fragment| fragment.map(|f| vec![Value::Text(f)])),
            TableCursor::Rows { rows, .. } => rows.next().map(Ok),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockBackend;

    fn ext() -> Extension {
        Extension::new(Arc::new(MockBackend::new()))
    }

    #[test]
    fn unknown_functions_are_rejected() {
        let err = ext().call("llm_nope", &[]).unwrap_err();
        assert_eq!(err.to_string(), "no such function: llm_nope");
    }

    #[test]
    fn chat_source_is_not_a_scalar() {
        let err = ext().call("llm_chat", &[Value::from("hi")]).unwrap_err();
        assert!(err.to_string().contains("table-valued"));
    }

    #[test]
    fn every_table_has_columns() {
        for name in [CHAT_TABLE, LOG_TABLE, HISTORY_TABLE, MESSAGES_TABLE] {
            assert!(columns(name).is_some(), "{}", name);
        }
        assert!(columns("ai_other").is_none());
    }

    #[test]
    fn function_names_include_tables() {
        let names: Vec<_> = Extension::function_names().collect();
        assert!(names.contains(&"llm_embed_generate"));
        assert!(names.contains(&"ai_log"));
    }

    #[test]
    fn snapshot_tables_take_no_arguments() {
        let mut e = ext();
        assert!(e.open_table("ai_log", &[Value::Integer(1)]).is_err());
        assert_eq!(e.open_table("AI_LOG", &[]).unwrap().count(), 0);
    }
}
