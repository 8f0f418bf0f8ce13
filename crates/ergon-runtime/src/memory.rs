//! The memory bundle.
//!
//! Agents in the `memory` category get `store_memory`, `retrieve_memory` and
//! `remember_interaction`. Entries live in a SQLite `memories` table keyed by
//! agent name, so a memory agent recalls across runs and processes. Each
//! agent keeps at most `max_entries` rows; older ones are pruned on insert.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ergon_core::{AgentDefinition, ErgonError, Result, ToolDeclaration};

use crate::bundle::{BundledTool, ToolBundle};
use crate::registry::ToolHandler;
use crate::resolver::is_sentinel;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent TEXT NOT NULL,
    key TEXT NOT NULL,
    content TEXT NOT NULL,
    stored_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_agent ON memories(agent, id);
";

fn db_err(e: rusqlite::Error) -> ErgonError {
    ErgonError::Memory(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub id: i64,
    pub key: String,
    pub content: String,
    pub stored_at: DateTime<Utc>,
}

/// Memories of every agent in one database. Safe to share across executions.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    max_entries: usize,
}

impl MemoryStore {
    /// Open or create the memory database at `path`.
    pub fn open(path: &Path, max_entries: usize) -> Result<Self> {
        info!(?path, "opening memory store");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::with_connection(conn, max_entries)
    }

    /// A store that lives as long as the process.
    pub fn in_memory(max_entries: usize) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?, max_entries)
    }

    fn with_connection(conn: Connection, max_entries: usize) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_entries,
        })
    }

    pub fn insert(&self, agent: &str, key: &str, content: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memories (agent, key, content, stored_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                agent,
                key,
                content,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )
        .map_err(db_err)?;
        let pruned = conn
            .execute(
                "DELETE FROM memories WHERE agent = ?1 AND id NOT IN
                 (SELECT id FROM memories WHERE agent = ?1 ORDER BY id DESC LIMIT ?2)",
                params![agent, self.max_entries as i64],
            )
            .map_err(db_err)?;
        if pruned > 0 {
            debug!(agent, pruned, "pruned old memories");
        }
        Ok(())
    }

    /// Every entry of `agent`, newest first.
    pub fn entries(&self, agent: &str) -> Result<Vec<MemoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, key, content, stored_at FROM memories
                 WHERE agent = ?1 ORDER BY id DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![agent], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, key, content, stored_at) = row.map_err(db_err)?;
            let stored_at = DateTime::parse_from_rfc3339(&stored_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| ErgonError::Memory(format!("bad timestamp '{stored_at}': {e}")))?;
            entries.push(MemoryEntry {
                id,
                key,
                content,
                stored_at,
            });
        }
        Ok(entries)
    }

    pub fn count(&self, agent: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories WHERE agent = ?1",
                params![agent],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// One agent's memories.
#[derive(Clone)]
pub struct MemoryBook {
    store: Arc<MemoryStore>,
    agent: String,
}

impl MemoryBook {
    pub fn new(store: Arc<MemoryStore>, agent: impl Into<String>) -> Self {
        Self {
            store,
            agent: agent.into(),
        }
    }

    pub fn count(&self) -> Result<usize> {
        self.store.count(&self.agent)
    }

    pub fn store(&self, key: &str, content: &str) -> Result<()> {
        self.store.insert(&self.agent, key, content)
    }

    pub fn remember_interaction(&self, user_message: &str, agent_response: &str) -> Result<()> {
        let key = format!("interaction_{}", Utc::now().to_rfc3339());
        self.store(
            &key,
            &format!("User: {user_message}\nAssistant: {agent_response}"),
        )
    }

    /// Entries sharing the most words with `query`, newest first on ties.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let terms = words(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(usize, MemoryEntry)> = self
            .store
            .entries(&self.agent)?
            .into_iter()
            .filter_map(|entry| {
                let haystack = format!("{} {}", entry.key, entry.content).to_lowercase();
                let score = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score > 0).then_some((score, entry))
            })
            .collect();
        // Stable sort: entries already come newest first.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Memories relevant to `input`, formatted for the system prompt.
    pub fn relevant_context(&self, input: &str) -> Result<Option<String>> {
        let hits = self.search(input, 3)?;
        if hits.is_empty() {
            return Ok(None);
        }
        let mut context = String::from("Relevant memories from past interactions:");
        for hit in hits {
            context.push_str(&format!("\n- {}: {}", hit.key, hit.content));
        }
        Ok(Some(context))
    }
}

/// Memory tools over a shared [`MemoryStore`].
pub struct MemoryBundle {
    store: Arc<MemoryStore>,
}

fn required_str<'a>(args: &'a Value, param: &str) -> anyhow::Result<&'a str> {
    match args.get(param).and_then(Value::as_str) {
        Some(v) if !is_sentinel(param, v) => Ok(v),
        _ => anyhow::bail!("missing required argument '{param}'"),
    }
}

impl MemoryBundle {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// The book of one agent. Agents are identified by name, which is stable
    /// across loads of the same definition.
    pub fn book(&self, agent: &AgentDefinition) -> MemoryBook {
        MemoryBook::new(Arc::clone(&self.store), &agent.name)
    }
}

impl ToolBundle for MemoryBundle {
    fn name(&self) -> &str {
        "memory"
    }

    fn tools(&self, agent: &AgentDefinition) -> Vec<BundledTool> {
        let book = self.book(agent);

        let store = {
            let book = book.clone();
            ToolHandler::blocking(move |args| {
                let key = required_str(&args, "key")?;
                let value = required_str(&args, "value")?;
                book.store(key, value)?;
                Ok(json!(format!("Successfully stored memory with key: {key}")))
            })
        };

        let retrieve = {
            let book = book.clone();
            ToolHandler::blocking(move |args| {
                let query = required_str(&args, "query")?;
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(3) as usize;
                let hits = book.search(query, limit)?;
                if hits.is_empty() {
                    return Ok(json!("No relevant memories found."));
                }
                let mut out = String::from("Found the following relevant memories:\n\n");
                for (i, hit) in hits.iter().enumerate() {
                    out.push_str(&format!("{}. {}\n\n", i + 1, hit.content));
                }
                Ok(json!(out))
            })
        };

        let remember = ToolHandler::blocking(move |args| {
            let user = required_str(&args, "user_message")?;
            let response = required_str(&args, "agent_response")?;
            book.remember_interaction(user, response)?;
            Ok(json!("Interaction stored in memory successfully."))
        });

        vec![
            BundledTool {
                declaration: ToolDeclaration::new(
                    "store_memory",
                    "Store a memory for future reference",
                    json!({
                        "type": "object",
                        "properties": {
                            "key": {"type": "string", "description": "Short label for the memory"},
                            "value": {"type": "string", "description": "What to remember"}
                        },
                        "required": ["key", "value"]
                    }),
                ),
                handler: store,
            },
            BundledTool {
                declaration: ToolDeclaration::new(
                    "retrieve_memory",
                    "Search memories for relevant information",
                    json!({
                        "type": "object",
                        "properties": {
                            "query": {"type": "string"},
                            "limit": {"type": "integer", "default": 3}
                        },
                        "required": ["query"]
                    }),
                ),
                handler: retrieve,
            },
            BundledTool {
                declaration: ToolDeclaration::new(
                    "remember_interaction",
                    "Store an interaction in memory",
                    json!({
                        "type": "object",
                        "properties": {
                            "user_message": {"type": "string"},
                            "agent_response": {"type": "string"}
                        },
                        "required": ["user_message", "agent_response"]
                    }),
                ),
                handler: remember,
            },
        ]
    }

    fn system_addendum(&self, agent: &AgentDefinition, input: &str) -> Option<String> {
        let context = match self.book(agent).relevant_context(input) {
            Ok(context) => context,
            Err(e) => {
                warn!(agent = %agent.name, error = %e, "could not read memories");
                None
            }
        };
        Some(context.unwrap_or_else(|| {
            "You are a memory-enabled assistant capable of remembering past interactions."
                .to_string()
        }))
    }

    fn record_exchange(&self, agent: &AgentDefinition, input: &str, response: &str) {
        if let Err(e) = self.book(agent).remember_interaction(input, response) {
            warn!(agent = %agent.name, error = %e, "could not record exchange");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_entries: usize) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::in_memory(max_entries).unwrap())
    }

    #[test]
    fn test_search_ranks_by_overlap() {
        let book = MemoryBook::new(store(50), "nexus");
        book.store("pet", "The user has a dog named Rex").unwrap();
        book.store("food", "The user likes pizza").unwrap();
        book.store("pet-food", "Rex eats dry dog food").unwrap();

        let hits = book.search("what does my dog Rex eat", 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, "pet-food");
        assert!(book.search("quantum", 3).unwrap().is_empty());
    }

    #[test]
    fn test_ties_prefer_newest() {
        let book = MemoryBook::new(store(50), "nexus");
        book.store("old", "favourite colour blue").unwrap();
        book.store("new", "favourite colour green").unwrap();
        let hits = book.search("favourite colour", 1).unwrap();
        assert_eq!(hits[0].key, "new");
    }

    #[test]
    fn test_oldest_entries_are_pruned() {
        let book = MemoryBook::new(store(3), "nexus");
        for i in 0..5 {
            book.store(&format!("k{i}"), &format!("fact number {i}")).unwrap();
        }
        assert_eq!(book.count().unwrap(), 3);
        let keys: Vec<String> = book
            .search("fact number", 10)
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["k4", "k3", "k2"]);
    }

    #[test]
    fn test_addendum_falls_back_to_reminder() {
        let bundle = MemoryBundle::new(store(50));
        let agent = AgentDefinition::new("nexus", "mock/echo", "").with_category("memory");
        let addendum = bundle.system_addendum(&agent, "hello").unwrap();
        assert!(addendum.contains("memory-enabled"));

        bundle.record_exchange(&agent, "my favourite colour is green", "Noted.");
        let addendum = bundle.system_addendum(&agent, "what colour do I like").unwrap();
        assert!(addendum.contains("green"));
    }

    #[test]
    fn test_books_are_per_agent_name() {
        let bundle = MemoryBundle::new(store(50));
        let a = AgentDefinition::new("a", "mock/echo", "");
        let b = AgentDefinition::new("b", "mock/echo", "");
        bundle.book(&a).store("k", "only for a").unwrap();
        assert_eq!(bundle.book(&a).count().unwrap(), 1);
        assert_eq!(bundle.book(&b).count().unwrap(), 0);

        // Same name, fresh id: the same book.
        let a_again = AgentDefinition::new("a", "mock/echo", "");
        assert_ne!(a.id, a_again.id);
        assert_eq!(bundle.book(&a_again).count().unwrap(), 1);
    }

    #[test]
    fn test_memories_survive_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let agent = AgentDefinition::new("nexus", "mock/echo", "").with_category("memory");

        let first = MemoryBundle::new(Arc::new(MemoryStore::open(&path, 10).unwrap()));
        first.record_exchange(&agent, "my dog is named Rex", "Noted.");
        drop(first);

        let second = MemoryBundle::new(Arc::new(MemoryStore::open(&path, 10).unwrap()));
        let addendum = second.system_addendum(&agent, "what is my dog called").unwrap();
        assert!(addendum.contains("Rex"));
    }

    #[tokio::test]
    async fn test_store_rejects_sentinel_argument() {
        let bundle = MemoryBundle::new(store(50));
        let agent = AgentDefinition::new("a", "mock/echo", "");
        let tools = bundle.tools(&agent);
        let store = &tools[0];
        let err = store
            .handler
            .call("store_memory", json!({"key": "default_key", "value": "x"}))
            .await
            .unwrap_err();
        assert!(err.message.contains("missing required argument 'key'"));
        assert_eq!(bundle.book(&agent).count().unwrap(), 0);
    }
}
