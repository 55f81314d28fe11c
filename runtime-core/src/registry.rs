//! Extension registry cache: reads and normalises the registry JSON file,
//! produces the broadcast frame sent before any CBOR bytes on a connection,
//! and drives the bootstrap slot table against it.

use std::fs;
use std::path::PathBuf;

use flux::logging::{self, Logger};
use hashbrown::HashMap;
use serde_json::Value as Json;

use crate::bootstrap::BootstrapExecutor;

/// The literal fallback used when the registry file is missing, empty, or
/// unreadable and the `freekill-core` entry file exists on disk. Carries the
/// `builtin` flag so clients can tell this implicit entry apart from one a
/// deployment actually configured.
const FALLBACK_REGISTRY_JSON: &str = r#"[{"name":"freekill-core","enabled":true,"builtin":true}]"#;

const CORE_ENTRY_SEARCH_CANDIDATES: &[&str] =
    &["packages/packages/freekill-core/lua/server/rpc/entry.lua", "packages/freekill-core/lua/server/rpc/entry.lua"];

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub name: String,
    pub entry_path: Option<String>,
    pub hash: Option<String>,
    pub url: Option<String>,
    pub enabled: bool,
    pub builtin: bool,
}

impl RegistryEntry {
    fn from_json(value: &Json) -> Option<RegistryEntry> {
        let object = value.as_object()?;
        let name = object.get("name")?.as_str()?.to_string();
        Some(RegistryEntry {
            name,
            entry_path: object.get("entry").and_then(Json::as_str).map(str::to_string),
            hash: object.get("hash").and_then(Json::as_str).map(str::to_string),
            url: object.get("url").and_then(Json::as_str).map(str::to_string),
            enabled: object.get("enabled").and_then(Json::as_bool).unwrap_or(true),
            builtin: object.get("builtin").and_then(Json::as_bool).unwrap_or(false),
        })
    }

    fn to_json(&self) -> Json {
        let mut object = serde_json::Map::new();
        object.insert("name".to_string(), Json::String(self.name.clone()));
        if let Some(entry) = &self.entry_path {
            object.insert("entry".to_string(), Json::String(entry.clone()));
        }
        if let Some(hash) = &self.hash {
            object.insert("hash".to_string(), Json::String(hash.clone()));
        }
        if let Some(url) = &self.url {
            object.insert("url".to_string(), Json::String(url.clone()));
        }
        object.insert("enabled".to_string(), Json::Bool(self.enabled));
        if self.builtin {
            object.insert("builtin".to_string(), Json::Bool(true));
        }
        Json::Object(object)
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapSlot {
    pub in_use: bool,
    pub generation: u64,
    pub loaded: bool,
    pub last_exit_code: i32,
    pub name: String,
    pub entry_path: Option<String>,
    pub hash: Option<String>,
}

impl BootstrapSlot {
    fn new(name: &str) -> Self {
        BootstrapSlot { in_use: false, generation: 0, loaded: false, last_exit_code: 0, name: name.to_string(), entry_path: None, hash: None }
    }
}

pub struct RegistryCache {
    registry_file: PathBuf,
    core_entry_search_path: Option<PathBuf>,
    refresh_interval_ms: u64,
    last_refresh_ms: Option<u64>,
    entries: Vec<RegistryEntry>,
    broadcast_frame: String,
    fingerprint: u64,
    slots: HashMap<String, BootstrapSlot>,
    generation: u64,
}

impl RegistryCache {
    pub fn new(registry_file: PathBuf, core_entry_search_path: Option<PathBuf>, refresh_interval_ms: u64) -> Self {
        RegistryCache {
            registry_file,
            core_entry_search_path,
            refresh_interval_ms,
            last_refresh_ms: None,
            entries: Vec::new(),
            broadcast_frame: format!("{{\"event\":\"extension_sync\",\"registry\":[]}}\n"),
            fingerprint: 0,
            slots: HashMap::new(),
            generation: 0,
        }
    }

    pub fn should_refresh(&self, now_ms: u64) -> bool {
        match self.last_refresh_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.refresh_interval_ms,
        }
    }

    /// The cached `extension_sync` broadcast frame — the very first bytes a
    /// newly accepted connection receives.
    pub fn broadcast_frame(&self) -> &str {
        &self.broadcast_frame
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    fn core_entry_exists(&self) -> Option<String> {
        for candidate in CORE_ENTRY_SEARCH_CANDIDATES {
            let path = match &self.core_entry_search_path {
                Some(prefix) => prefix.join(candidate),
                None => PathBuf::from(candidate),
            };
            if path.exists() {
                return Some(path.to_string_lossy().into_owned());
            }
        }
        None
    }

    fn load_raw(&self) -> Option<String> {
        fs::read_to_string(&self.registry_file).ok()
    }

    fn parse_or_fallback(&self, log: &Logger) -> Vec<RegistryEntry> {
        let raw = self.load_raw();
        let trimmed = raw.as_deref().map(|s| s.trim_start_matches('\u{feff}').trim());

        match trimmed.filter(|s| !s.is_empty()) {
            Some(text) => match serde_json::from_str::<Json>(text) {
                Ok(Json::Array(items)) => items.iter().filter_map(RegistryEntry::from_json).collect(),
                _ => {
                    logging::info!(log, "extension registry malformed, using fallback"; "path" => self.registry_file.to_string_lossy().into_owned());
                    self.fallback_entries(log)
                }
            },
            None => self.fallback_entries(log),
        }
    }

    fn fallback_entries(&self, log: &Logger) -> Vec<RegistryEntry> {
        match self.core_entry_exists() {
            Some(entry_path) => {
                logging::info!(log, "extension registry fallback"; "source" => entry_path.clone());
                let fallback_json: Json = serde_json::from_str(FALLBACK_REGISTRY_JSON).expect("fallback literal is valid json");
                let mut entries: Vec<RegistryEntry> =
                    fallback_json.as_array().unwrap().iter().filter_map(RegistryEntry::from_json).collect();
                for entry in &mut entries {
                    entry.entry_path = Some(entry_path.clone());
                }
                entries
            }
            None => Vec::new(),
        }
    }

    /// Reads, normalises, and caches the broadcast frame; syncs the
    /// bootstrap slot table against the freshly parsed entries. Returns
    /// `true` if the broadcast frame's content actually changed (used to
    /// gate log-spam-suppressed "sync payload ready" logging at the
    /// fingerprint level).
    pub fn refresh(&mut self, now_ms: u64, executor: &mut dyn BootstrapExecutor, bootstrap_enable: bool, log: &Logger) -> bool {
        self.last_refresh_ms = Some(now_ms);
        self.generation += 1;
        self.entries = self.parse_or_fallback(log);

        for entry in &self.entries {
            let slot = self.slots.entry(entry.name.clone()).or_insert_with(|| BootstrapSlot::new(&entry.name));
            let changed = slot.entry_path.as_deref() != entry.entry_path.as_deref() || slot.hash.as_deref() != entry.hash.as_deref() || !slot.loaded;

            if changed && bootstrap_enable {
                let loaded = executor.bootstrap(&entry.name, entry.entry_path.as_deref(), entry.hash.as_deref());
                slot.loaded = loaded;
                slot.last_exit_code = if loaded { 0 } else { 1 };
                slot.entry_path = entry.entry_path.clone();
                slot.hash = entry.hash.clone();
            }
            slot.generation = self.generation;
            slot.in_use = true;
        }

        for slot in self.slots.values_mut() {
            if slot.generation != self.generation {
                slot.in_use = false;
            }
        }

        let registry_json: Vec<Json> = self.entries.iter().map(RegistryEntry::to_json).collect();
        let registry_json_text = serde_json::to_string(&Json::Array(registry_json)).unwrap_or_else(|_| "[]".to_string());
        let frame = format!("{{\"event\":\"extension_sync\",\"registry\":{}}}\n", registry_json_text);

        let fingerprint = fingerprint_of(&frame);
        let changed = fingerprint != self.fingerprint;
        if changed {
            self.fingerprint = fingerprint;
            logging::info!(log, "extension sync payload ready"; "bytes" => frame.len());
        }
        self.broadcast_frame = frame;
        changed
    }

    /// Fires `on_server_stop` exactly once for every extension still marked
    /// loaded, whether it's still in the live registry or went stale across a
    /// refresh. Hooks only fire here, at process exit, per the design note
    /// that in-flight hook timing during live refreshes is unspecified.
    pub fn shutdown(&mut self, executor: &mut dyn BootstrapExecutor) {
        for slot in self.slots.values_mut() {
            if slot.loaded {
                executor.hook(&slot.name, slot.entry_path.as_deref(), slot.hash.as_deref(), "on_server_stop");
                slot.loaded = false;
            }
        }
    }

    pub fn slot(&self, name: &str) -> Option<&BootstrapSlot> {
        self.slots.get(name)
    }
}

fn fingerprint_of(text: &str) -> u64 {
    // FNV-1a, deliberately simple — only used to suppress duplicate log lines.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in text.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
