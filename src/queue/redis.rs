//! Redis-backed task queue.
//!
//! [`RedisQueue`] implements [`TaskQueue`] on a single multiplexed
//! connection. Multi-key updates run as Lua scripts (`redis::Script`) so a
//! task is never visible half-enqueued or claimed twice.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{queue}:id` | String | Id counter (`INCR`) |
//! | `{queue}:wait` | List | Waiting ids, pushed left, popped right |
//! | `{queue}:task:{id}` | Hash | Task record |
//! | `{queue}:index` | Sorted Set | Every id, scored by id |
//!
//! Task hash fields:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `data` | Serialized [`Task`] JSON |
//! | `state` | [`QueueState`] wire name |
//! | `outcome` | Serialized [`TaskOutcome`] JSON, once acknowledged |

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use tracing::warn;

use super::{QueueState, QueuedTask, TaskQueue, TaskRequest};
use crate::error::QueueError;
use crate::types::{Task, TaskOutcome};

/// Stores a new task and makes it claimable.
///
/// KEYS[1] = task hash, KEYS[2] = wait list, KEYS[3] = index.
/// ARGV[1] = task JSON, ARGV[2] = task id.
const LUA_ENQUEUE: &str = r#"
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'state', 'waiting')
redis.call('ZADD', KEYS[3], tonumber(ARGV[2]), ARGV[2])
redis.call('LPUSH', KEYS[2], ARGV[2])
return 1
"#;

/// Pops the oldest waiting id and marks it active.
///
/// KEYS[1] = wait list. ARGV[1] = task hash key prefix (`{queue}:task:`).
/// Returns: nil when empty, otherwise {id, task JSON}.
const LUA_CLAIM: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then
    return false
end
local key = ARGV[1] .. id
redis.call('HSET', key, 'state', 'active')
local data = redis.call('HGET', key, 'data')
if not data then
    data = ''
end
return {id, data}
"#;

/// Records a terminal state.
///
/// KEYS[1] = task hash. ARGV[1] = state, ARGV[2] = outcome JSON.
/// Returns: 1 on success, 0 if the task does not exist.
const LUA_ACK: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[1], 'outcome', ARGV[2])
return 1
"#;

/// Redis-backed [`TaskQueue`].
///
/// # Examples
///
/// ```rust,no_run
/// use cancelable_worker::queue::{RedisQueue, TaskQueue, TaskRequest};
///
/// # async fn example() {
/// let queue = RedisQueue::new("redis://127.0.0.1:6379", "dockerQueue").await.unwrap();
/// let task = queue.enqueue(TaskRequest::demo()).await.unwrap();
/// println!("Added task {}", task.id());
/// # }
/// ```
#[derive(Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
    name: String,
}

impl RedisQueue {
    /// Connects to Redis at `url` and uses the queue `name`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the client cannot be created or the
    /// connection cannot be established.
    pub async fn new(url: &str, name: impl Into<String>) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(url).map_err(|e| QueueError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn, name))
    }

    /// Uses an existing connection.
    pub fn with_connection(conn: MultiplexedConnection, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
        }
    }

    /// The queue name all keys are prefixed with.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn id_key(&self) -> String {
        format!("{}:id", self.name)
    }

    fn wait_key(&self) -> String {
        format!("{}:wait", self.name)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.name)
    }

    fn task_prefix(&self) -> String {
        format!("{}:task:", self.name)
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("{}{task_id}", self.task_prefix())
    }
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue").field("name", &self.name).finish_non_exhaustive()
    }
}

fn map_redis_error(err: ::redis::RedisError, context: &str) -> QueueError {
    QueueError::Backend {
        message: format!("{context}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn encode<T: serde::Serialize>(task_id: &str, value: &T) -> Result<String, QueueError> {
    serde_json::to_string(value).map_err(|e| QueueError::Corrupt {
        task_id: task_id.to_string(),
        message: format!("failed to serialize: {e}"),
    })
}

fn decode_task(task_id: &str, data: &str) -> Result<Task, QueueError> {
    serde_json::from_str(data).map_err(|e| QueueError::Corrupt {
        task_id: task_id.to_string(),
        message: format!("invalid task data: {e}"),
    })
}

/// Rebuilds a [`QueuedTask`] from its hash fields.
fn decode_record(task_id: &str, fields: &HashMap<String, String>) -> Result<QueuedTask, QueueError> {
    let data = fields.get("data").ok_or_else(|| QueueError::Corrupt {
        task_id: task_id.to_string(),
        message: "missing data field".to_string(),
    })?;
    let task = decode_task(task_id, data)?;
    let state = fields
        .get("state")
        .and_then(|s| QueueState::parse(s))
        .ok_or_else(|| QueueError::Corrupt {
            task_id: task_id.to_string(),
            message: "missing or invalid state field".to_string(),
        })?;
    let outcome = match fields.get("outcome") {
        Some(raw) => Some(serde_json::from_str(raw).map_err(|e| QueueError::Corrupt {
            task_id: task_id.to_string(),
            message: format!("invalid outcome data: {e}"),
        })?),
        None => None,
    };
    Ok(QueuedTask {
        task,
        state,
        outcome,
    })
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, request: TaskRequest) -> Result<Task, QueueError> {
        let mut conn = self.conn.clone();
        let id: u64 = conn
            .incr(self.id_key(), 1u64)
            .await
            .map_err(|e| map_redis_error(e, "failed to allocate task id"))?;
        let task = request.into_task(id.to_string());
        let data = encode(task.id(), &task)?;

        let script = Script::new(LUA_ENQUEUE);
        let _: i64 = script
            .key(self.task_key(task.id()))
            .key(self.wait_key())
            .key(self.index_key())
            .arg(data)
            .arg(task.id())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "failed to enqueue task"))?;
        Ok(task)
    }

    async fn next(&self) -> Result<Option<Task>, QueueError> {
        let script = Script::new(LUA_CLAIM);
        let claimed: Option<(String, String)> = script
            .key(self.wait_key())
            .arg(self.task_prefix())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "failed to claim task"))?;
        match claimed {
            None => Ok(None),
            Some((id, data)) => decode_task(&id, &data).map(Some),
        }
    }

    async fn acknowledge(&self, outcome: &TaskOutcome) -> Result<(), QueueError> {
        let task_id = outcome.task_id();
        let state = QueueState::from_outcome(outcome.status());
        let script = Script::new(LUA_ACK);
        let recorded: i64 = script
            .key(self.task_key(task_id))
            .arg(state.as_str())
            .arg(encode(task_id, outcome)?)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "failed to acknowledge task"))?;
        if recorded == 0 {
            return Err(QueueError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    async fn state(&self, task_id: &str) -> Result<QueueState, QueueError> {
        let raw: Option<String> = self
            .conn
            .clone()
            .hget(self.task_key(task_id), "state")
            .await
            .map_err(|e| map_redis_error(e, "failed to read task state"))?;
        let raw = raw.ok_or_else(|| QueueError::NotFound {
            task_id: task_id.to_string(),
        })?;
        QueueState::parse(&raw).ok_or_else(|| QueueError::Corrupt {
            task_id: task_id.to_string(),
            message: format!("unknown state {raw:?}"),
        })
    }

    async fn list(&self) -> Result<Vec<QueuedTask>, QueueError> {
        let ids: Vec<String> = self
            .conn
            .clone()
            .zrange(self.index_key(), 0, -1)
            .await
            .map_err(|e| map_redis_error(e, "failed to read task index"))?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in &ids {
            let fields: HashMap<String, String> = self
                .conn
                .clone()
                .hgetall(self.task_key(id))
                .await
                .map_err(|e| map_redis_error(e, "failed to read task"))?;
            if fields.is_empty() {
                warn!(task_id = %id, "index entry without task record");
                continue;
            }
            tasks.push(decode_record(id, &fields)?);
        }
        Ok(tasks)
    }
}
