//! Cache key derivation and the response cache facade.
//!
//! Keys are derived from everything that changes the completion: task, model,
//! persona and the normalized prompt plus ordered context. Account identity is
//! deliberately excluded so identical questions share one entry across users.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::store::{CachedCompletion, GatewayStore};
use crate::types::TaskRequest;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            out.push(HEX_CHARS[(byte >> 4) as usize] as char);
            out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
            out
        },
    )
}

/// Collapse runs of whitespace and trim, lowercasing nothing: "Three  of
/// cups " and "Three of cups" hit the same entry, but distinct wordings stay
/// distinct.
pub fn normalize_prompt(prompt: &str) -> String {
    let mut out = String::with_capacity(prompt.len());
    let mut last_was_space = false;
    for ch in prompt.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out
}

/// Deterministic cache key. Fields are length-prefixed before hashing so no
/// two distinct inputs can collide by concatenation.
pub fn prompt_key(request: &TaskRequest, model: &str) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |part: &str| {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    };

    feed(request.task.as_str());
    feed(model);
    feed(request.persona.as_deref().unwrap_or(""));
    feed(&normalize_prompt(&request.prompt));
    for (name, value) in &request.context {
        feed(name);
        feed(value);
    }

    to_hex(&hasher.finalize())
}

/// Thin facade over the store's cache table; owns nothing but the TTL math.
pub struct ResponseCache {
    store: Arc<dyn GatewayStore>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self { store }
    }

    pub async fn lookup(&self, key: &str, now: u64) -> Result<Option<CachedCompletion>> {
        Ok(self.store.cache_get(key, now).await?)
    }

    pub async fn populate(
        &self,
        key: &str,
        text: String,
        token_cost: u64,
        now: u64,
        ttl_secs: u64,
    ) -> Result<CachedCompletion> {
        let entry = CachedCompletion {
            text,
            token_cost,
            created_at: now,
            expires_at: now.saturating_add(ttl_secs),
            hit_count: 0,
        };
        self.store.cache_put(key, &entry).await?;
        Ok(entry)
    }
}
