use std::collections::HashMap;
use std::sync::RwLock;

use md5::{Digest, Md5};
use time::OffsetDateTime;

/// Client features a request arrives with; the router extracts these from
/// connection info and headers before translation starts.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub client_ip: String,
    pub user_agent: String,
    /// `X-Conversation-ID` or any accepted session-id header.
    pub conversation_id_override: Option<String>,
    /// `X-Agent-Continuation-ID`.
    pub continuation_id_override: Option<String>,
}

/// Derives stable conversation / continuation ids from
/// `(client IP, User-Agent, time window)` so one client's consecutive turns
/// land in one upstream conversation without client cooperation.
pub struct IdentityManager {
    conversation_cache: RwLock<HashMap<String, String>>,
}

impl IdentityManager {
    pub fn new() -> Self {
        Self {
            conversation_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn conversation_id(&self, ctx: &ClientContext, window_min: u32) -> String {
        if let Some(id) = &ctx.conversation_id_override {
            if !id.is_empty() {
                return id.clone();
            }
        }

        let window_min = if window_min == 0 { 60 } else { window_min };
        let window_start =
            OffsetDateTime::now_utc().unix_timestamp() / (window_min as i64 * 60);
        let signature = format!("{}|{}|{}", ctx.client_ip, ctx.user_agent, window_start);

        if let Ok(cache) = self.conversation_cache.read() {
            if let Some(id) = cache.get(&signature) {
                return id.clone();
            }
        }

        let digest = Md5::digest(signature.as_bytes());
        let mut id = String::from("conv-");
        for byte in &digest[..8] {
            id.push_str(&format!("{byte:02x}"));
        }

        let mut cache = match self.conversation_cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.insert(signature, id.clone());
        id
    }

    pub fn continuation_id(&self, ctx: &ClientContext) -> String {
        if let Some(id) = &ctx.continuation_id_override {
            if !id.is_empty() {
                return id.clone();
            }
        }
        // Hour bucket, matching the conversation window so both ids stay
        // stable together within a session.
        let now = OffsetDateTime::now_utc();
        let hour_bucket = format!(
            "{:04}{:02}{:02}{:02}",
            now.year(),
            now.month() as u8,
            now.day(),
            now.hour()
        );
        let input = format!("agent|{}|{}|{}", ctx.client_ip, ctx.user_agent, hour_bucket);
        deterministic_guid(&input, "agent")
    }

    /// Drop cached signatures; the window encoding regenerates them.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.conversation_cache.write() {
            cache.clear();
        }
    }
}

impl Default for IdentityManager {
    fn default() -> Self {
        Self::new()
    }
}

/// UUID-v5-shaped GUID from an MD5 of the namespaced input: version and
/// variant bits are forced so the output parses as a standard UUID.
fn deterministic_guid(input: &str, namespace: &str) -> String {
    let namespaced = format!("{namespace}|{input}");
    let mut bytes: [u8; 16] = Md5::digest(namespaced.as_bytes()).into();
    bytes[6] = (bytes[6] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "{}-{}-{}-{}-{}",
        hex(&bytes[0..4]),
        hex(&bytes[4..6]),
        hex(&bytes[6..8]),
        hex(&bytes[8..10]),
        hex(&bytes[10..16]),
    )
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
