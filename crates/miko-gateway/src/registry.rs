// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Character registry and hot-reload discipline.
//!
//! One entry per character: its session manager, the websocket lock that
//! serializes preserve/restore decisions against session cleanup, the
//! takeover guard for competing user sockets, and the monitor sync
//! connector.  `reload` applies new character configuration without
//! disturbing connected users: a character with an active realtime session
//! only has its prompt and voice mutated in place; an inactive one gets a
//! fresh manager; a deleted one is torn down, daemon thread included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use miko_config::{CharacterConfig, Config};
use miko_model::ChatModel;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::manager::SessionManager;
use crate::sync::{join_with_timeout, spawn_sync_connector};

const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct MonitorHandle {
    tx: std::sync::mpsc::Sender<Value>,
    shutdown: Arc<AtomicBool>,
    thread: StdMutex<Option<JoinHandle<()>>>,
}

pub struct CharacterEntry {
    pub manager: StdMutex<Arc<SessionManager>>,
    /// Serializes preserve/restore decisions, session manipulation, and
    /// cleanup for this character.
    pub ws_lock: Arc<tokio::sync::Mutex<()>>,
    /// The newest user connection wins; older sockets check this id.
    pub session_id: StdMutex<Option<Uuid>>,
    monitor: MonitorHandle,
}

impl CharacterEntry {
    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.lock().unwrap().clone()
    }
}

pub struct CharacterRegistry {
    entries: StdMutex<HashMap<String, Arc<CharacterEntry>>>,
    /// Insertion order of characters, so "the current character" hints are
    /// deterministic.
    order: StdMutex<Vec<String>>,
    config: Arc<Config>,
    vision: Option<Arc<dyn ChatModel>>,
}

impl CharacterRegistry {
    pub fn new(config: Arc<Config>, vision: Option<Arc<dyn ChatModel>>) -> Arc<Self> {
        Arc::new(Self {
            entries: StdMutex::new(HashMap::new()),
            order: StdMutex::new(Vec::new()),
            config,
            vision,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<CharacterEntry>> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn first_name(&self) -> Option<String> {
        self.order.lock().unwrap().first().cloned()
    }

    fn build_entry(&self, character: &CharacterConfig) -> Arc<CharacterEntry> {
        let (tx, rx) = std::sync::mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = spawn_sync_connector(
            character.name.clone(),
            self.config.ports.monitor_ws_url(),
            rx,
            shutdown.clone(),
        );
        let manager = SessionManager::new(
            character.name.clone(),
            character.prompt.clone(),
            character.voice_id.clone(),
            character.model.clone(),
            self.config.clone(),
            tx.clone(),
            self.vision.clone(),
        );
        Arc::new(CharacterEntry {
            manager: StdMutex::new(manager),
            ws_lock: Arc::new(tokio::sync::Mutex::new(())),
            session_id: StdMutex::new(None),
            monitor: MonitorHandle {
                tx,
                shutdown,
                thread: StdMutex::new(Some(thread)),
            },
        })
    }

    /// Apply a character list: add new characters, update existing ones
    /// under their websocket lock, and tear down removed ones.
    pub async fn reload(&self, characters: &[CharacterConfig]) {
        info!(count = characters.len(), "reloading character configuration");

        for character in characters {
            let existing = self.get(&character.name);
            match existing {
                None => {
                    let entry = self.build_entry(character);
                    self.entries
                        .lock()
                        .unwrap()
                        .insert(character.name.clone(), entry);
                    self.order.lock().unwrap().push(character.name.clone());
                    info!(character = %character.name, "character added");
                }
                Some(entry) => {
                    // The lock serializes this decision against any
                    // concurrent websocket preserve/restore or cleanup.
                    let _guard = entry.ws_lock.lock().await;
                    let manager = entry.manager();
                    if manager.is_active() {
                        // A live session: never replace the manager, only
                        // mutate configuration in place.
                        manager.set_prompt(character.prompt.clone());
                        manager.set_voice_id(character.voice_id.clone());
                        info!(character = %character.name, "active session, config updated in place");
                    } else {
                        let replacement = SessionManager::new(
                            character.name.clone(),
                            character.prompt.clone(),
                            character.voice_id.clone(),
                            character.model.clone(),
                            self.config.clone(),
                            entry.monitor.tx.clone(),
                            self.vision.clone(),
                        );
                        // Preserve a connected user socket across the swap.
                        if let Some(user_tx) = manager.user_sender() {
                            replacement.attach_user(user_tx);
                        }
                        *entry.manager.lock().unwrap() = replacement;
                        info!(character = %character.name, "session manager replaced");
                    }
                }
            }
        }

        // Tear down characters that no longer exist.
        let wanted: Vec<&str> = characters.iter().map(|c| c.name.as_str()).collect();
        let removed: Vec<String> = self
            .order
            .lock()
            .unwrap()
            .iter()
            .filter(|name| !wanted.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            self.remove(&name).await;
        }
    }

    /// Remove one character: close its session, signal its sync connector,
    /// and join the daemon thread with a bounded wait.
    pub async fn remove(&self, name: &str) {
        let Some(entry) = self.entries.lock().unwrap().remove(name) else {
            return;
        };
        self.order.lock().unwrap().retain(|n| n != name);
        info!(character = %name, "removing character");

        let _guard = entry.ws_lock.lock().await;
        entry.manager().end_session().await;

        entry.monitor.shutdown.store(true, Ordering::SeqCst);
        let thread = entry.monitor.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            if !join_with_timeout(thread, THREAD_JOIN_TIMEOUT) {
                warn!(character = %name, "sync connector abandoned after join timeout");
            }
        }
    }

    /// Voice change for a character with a connected frontend, in the only
    /// safe order: tell the frontend to reload, close the session, then
    /// rebuild the manager with the new voice.
    pub async fn apply_voice_change(&self, name: &str, voice_id: Option<String>) -> bool {
        let Some(entry) = self.get(name) else {
            return false;
        };

        let manager = entry.manager();
        let was_active = manager.is_active();
        if was_active {
            manager.send_user(json!({
                "type": "reload_page",
                "message": "语音已更新，页面即将刷新",
            }));
            manager.end_session().await;
        }

        let _guard = entry.ws_lock.lock().await;
        let manager = entry.manager();
        manager.set_voice_id(voice_id);
        info!(character = %name, session_restarted = was_active, "voice updated");
        true
    }

    /// Close every session and stop every connector.  Used on shutdown.
    pub async fn shutdown(&self) {
        let names = self.names();
        for name in names {
            self.remove(&name).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn character(name: &str, prompt: &str) -> CharacterConfig {
        CharacterConfig {
            name: name.into(),
            prompt: prompt.into(),
            voice_id: None,
            model: None,
        }
    }

    fn registry() -> Arc<CharacterRegistry> {
        CharacterRegistry::new(Arc::new(Config::default()), None)
    }

    #[tokio::test]
    async fn reload_adds_and_orders_characters() {
        let reg = registry();
        reg.reload(&[character("momo", "a"), character("yuki", "b")])
            .await;
        assert_eq!(reg.names(), vec!["momo", "yuki"]);
        assert_eq!(reg.first_name().as_deref(), Some("momo"));
        assert!(reg.get("momo").is_some());
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn reload_replaces_inactive_manager() {
        let reg = registry();
        reg.reload(&[character("momo", "old prompt")]).await;
        let before = reg.get("momo").unwrap().manager();

        reg.reload(&[character("momo", "new prompt")]).await;
        let after = reg.get("momo").unwrap().manager();
        assert!(!Arc::ptr_eq(&before, &after));
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn reload_preserves_user_channel_across_replacement() {
        let reg = registry();
        reg.reload(&[character("momo", "old")]).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        reg.get("momo").unwrap().manager().attach_user(tx);

        reg.reload(&[character("momo", "new")]).await;
        reg.get("momo").unwrap().manager().send_status("hello");
        assert!(rx.try_recv().is_ok());
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn reload_mutates_active_manager_in_place() {
        let reg = registry();
        reg.reload(&[character("momo", "old")]).await;
        let manager = reg.get("momo").unwrap().manager();
        manager.force_active(true);

        let mut updated = character("momo", "new");
        updated.voice_id = Some("v2".into());
        reg.reload(&[updated]).await;

        let after = reg.get("momo").unwrap().manager();
        // Same manager object, new configuration.
        assert!(Arc::ptr_eq(&manager, &after));
        assert_eq!(after.voice_id().as_deref(), Some("v2"));

        after.force_active(false);
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn removed_character_is_torn_down() {
        let reg = registry();
        reg.reload(&[character("momo", "a"), character("yuki", "b")])
            .await;
        reg.reload(&[character("momo", "a")]).await;
        assert!(reg.get("yuki").is_none());
        assert_eq!(reg.names(), vec!["momo"]);
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn apply_voice_change_updates_inactive_character() {
        let reg = registry();
        reg.reload(&[character("momo", "a")]).await;
        assert!(reg.apply_voice_change("momo", Some("v9".into())).await);
        assert_eq!(
            reg.get("momo").unwrap().manager().voice_id().as_deref(),
            Some("v9")
        );
        assert!(!reg.apply_voice_change("ghost", None).await);
        reg.shutdown().await;
    }
}
