//! Redis-backed [`BufferStore`].
//!
//! Appends are MULTI/EXEC pipelines. In-place updates and batch pops are Lua
//! scripts so they cannot interleave with an append from another node.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use spark_shared::{Chat, EventEnvelope, KeySpace, Message, MessagePatch};

use crate::error::Result;
use crate::store::{decode_entries, BufferStore};
use crate::subscription::{Subscription, SubscriptionOptions};

/// KEYS[1] buffer list. ARGV: message id, patch json, now (RFC 3339).
/// Returns `{merged, content_changed}` or nil when the id is not buffered.
const UPDATE_SCRIPT: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
local patch = cjson.decode(ARGV[2])
for i, raw in ipairs(entries) do
  local ok, msg = pcall(cjson.decode, raw)
  if ok and msg.id == ARGV[1] then
    local changed = 0
    if patch.content ~= nil and patch.content ~= '' and patch.content ~= msg.content then
      msg.content = patch.content
      changed = 1
    end
    if patch.type ~= nil then msg.type = patch.type end
    if patch.received ~= nil then msg.received = patch.received end
    if patch.seen ~= nil then msg.seen = patch.seen end
    if patch.media ~= nil then msg.media = patch.media end
    if patch.reactions ~= nil then msg.reactions = patch.reactions end
    if type(msg.reactions) ~= 'table' then msg.reactions = {} end
    local rm = patch.remove_reactions
    if rm ~= nil then
      local kept = {}
      for _, r in ipairs(msg.reactions) do
        local same_content = rm.content == nil or rm.content == '' or r.content == rm.content
        if not (r.sender_id == rm.sender_id and same_content) then
          table.insert(kept, r)
        end
      end
      msg.reactions = kept
    end
    if patch.add_reaction ~= nil then table.insert(msg.reactions, patch.add_reaction) end
    if changed == 1 then msg.updated_at = ARGV[3] end
    local merged = cjson.encode(msg)
    redis.call('LSET', KEYS[1], i - 1, merged)
    return {merged, changed}
  end
end
return false
"#;

/// KEYS[1] buffer list. ARGV[1] count.
const POP_SCRIPT: &str = r#"
local count = tonumber(ARGV[1])
local items = redis.call('LRANGE', KEYS[1], 0, count - 1)
redis.call('LTRIM', KEYS[1], count, -1)
return items
"#;

pub struct RedisBuffer {
    client: Client,
    conn: OnceCell<MultiplexedConnection>,
    keys: KeySpace,
    options: SubscriptionOptions,
    update_script: Script,
    pop_script: Script,
}

impl RedisBuffer {
    /// Build a client for `url`. No connection is made until first use.
    pub fn open(url: &str, keys: KeySpace) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            keys,
            options: SubscriptionOptions::default(),
            update_script: Script::new(UPDATE_SCRIPT),
            pop_script: Script::new(POP_SCRIPT),
        })
    }

    pub fn with_subscription_options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!("opening multiplexed redis connection");
                self.client.get_multiplexed_async_connection().await
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl BufferStore for RedisBuffer {
    async fn append(
        &self,
        chat_id: &str,
        message: &Message,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let entry = serde_json::to_string(message)?;
        let payload = event.to_json()?;
        let ts = now.timestamp();
        let mut conn = self.conn().await?;

        let (len,): (usize,) = redis::pipe()
            .atomic()
            .rpush(self.keys.messages(chat_id), entry)
            .publish(self.keys.channel(chat_id), payload)
            .ignore()
            .hset(self.keys.meta(chat_id), "last_activity_ts", ts)
            .ignore()
            .zadd(self.keys.active(), chat_id, ts)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn buffered(&self, chat_id: &str) -> Result<Vec<Message>> {
        let mut conn = self.conn().await?;
        let entries: Vec<String> = conn.lrange(self.keys.messages(chat_id), 0, -1).await?;
        Ok(decode_entries(chat_id, entries))
    }

    async fn len(&self, chat_id: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        let len: usize = conn.llen(self.keys.messages(chat_id)).await?;
        Ok(len)
    }

    async fn update_buffered(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: &MessagePatch,
        now: DateTime<Utc>,
    ) -> Result<Option<(Message, bool)>> {
        let patch_json = serde_json::to_string(patch)?;
        let mut conn = self.conn().await?;

        let reply: Option<(String, i64)> = self
            .update_script
            .key(self.keys.messages(chat_id))
            .arg(message_id)
            .arg(patch_json)
            .arg(now.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .invoke_async(&mut conn)
            .await?;

        match reply {
            Some((merged, changed)) => {
                let message: Message = serde_json::from_str(&merged)?;
                Ok(Some((message, changed == 1)))
            }
            None => Ok(None),
        }
    }

    async fn pop_front(&self, chat_id: &str, count: usize) -> Result<Vec<Message>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let entries: Vec<String> = self
            .pop_script
            .key(self.keys.messages(chat_id))
            .arg(count)
            .invoke_async(&mut conn)
            .await?;
        Ok(decode_entries(chat_id, entries))
    }

    async fn push_front(&self, chat_id: &str, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        // LPUSH inserts its arguments one by one at the head.
        let entries = messages
            .iter()
            .rev()
            .map(serde_json::to_string)
            .collect::<serde_json::Result<Vec<_>>>()?;
        let mut conn = self.conn().await?;
        let _: usize = conn.lpush(self.keys.messages(chat_id), entries).await?;
        Ok(())
    }

    async fn publish(&self, chat_id: &str, event: &EventEnvelope) -> Result<()> {
        let payload = event.to_json()?;
        let mut conn = self.conn().await?;
        let _: usize = conn.publish(self.keys.channel(chat_id), payload).await?;
        Ok(())
    }

    async fn subscribe(&self, chat_id: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.keys.channel(chat_id)).await?;

        let owner = chat_id.to_string();
        let payloads = pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let payload = match msg.get_payload::<String>() {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(chat_id = %owner, error = %e, "non-text pubsub payload");
                        None
                    }
                };
                async move { payload }
            })
            .boxed();

        Ok(Subscription::spawn(chat_id, payloads, self.options))
    }

    async fn cached_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.keys.chat(chat_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn cache_chat(&self, chat: &Chat, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(chat)?;
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(self.keys.chat(&chat.id), raw, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn invalidate_chat(&self, chat_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: usize = conn.del(self.keys.chat(chat_id)).await?;
        Ok(())
    }

    async fn flush_token(&self, chat_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let token: Option<String> = conn.get(self.keys.flush_token(chat_id)).await?;
        Ok(token)
    }

    async fn set_flush_token(&self, chat_id: &str, token: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(self.keys.flush_token(chat_id), token, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn active_chats(&self, idle_since: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.active(), "-inf", idle_since.timestamp())
            .await?;
        Ok(ids)
    }

    async fn remove_active(&self, chat_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: usize = conn.zrem(self.keys.active(), chat_id).await?;
        Ok(())
    }
}
