//! Apps Broker (C8)
//!
//! Collaborative in-room documents backed by `yrs`/`y-sync` CRDTs, plus an
//! awareness registry per app for cursor/presence-style ephemeral state.
//! Persistence of app documents across room lifetimes is explicitly out of
//! scope (spec §1 Non-goals: "the CRDT persistence layer").

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use y_sync::awareness::{Awareness, AwarenessUpdate as YAwarenessUpdate};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use crate::error::ErrorKind;
use crate::session::UserId;

/// A y-sync protocol frame (sync step 1/2 or update), opaque at this layer
/// — just bytes ferried between the CRDT runtime and the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage(#[serde(with = "bytes_as_base64")] pub Vec<u8>);

/// An awareness protocol frame (presence/cursor state), same treatment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwarenessUpdate(#[serde(with = "bytes_as_base64")] pub Vec<u8>);

mod bytes_as_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

struct AppDoc {
    doc: Doc,
    awareness: Awareness,
    /// `userKey -> {clientIds}`, so a disconnecting user's awareness state
    /// can be GC'd without it having explicitly left (spec §3: "per-user
    /// index of client-ids for GC").
    client_ids_by_user: HashMap<String, HashSet<u64>>,
}

impl AppDoc {
    fn new() -> Self {
        let doc = Doc::new();
        let awareness = Awareness::new(doc.clone());
        Self {
            doc,
            awareness,
            client_ids_by_user: HashMap::new(),
        }
    }

    /// Remove every tracked client id's awareness state and encode the
    /// resulting removal frame, if any clients were tracked at all.
    fn clear_awareness(&mut self) -> Option<AwarenessUpdate> {
        let client_ids: Vec<u64> = self.client_ids_by_user.values().flatten().copied().collect();
        self.client_ids_by_user.clear();
        encode_removal(&mut self.awareness, client_ids)
    }
}

/// Remove the given client ids from `awareness` and encode the removal as
/// an [`AwarenessUpdate`] frame, matching the "removeAwarenessStates"
/// operation from the opaque awareness interface (spec §9 DESIGN NOTES).
fn encode_removal(awareness: &mut Awareness, client_ids: Vec<u64>) -> Option<AwarenessUpdate> {
    if client_ids.is_empty() {
        return None;
    }
    for &client_id in &client_ids {
        awareness.remove_state(client_id);
    }
    let update = awareness.update_with_clients(client_ids).ok()?;
    Some(AwarenessUpdate(update.encode_v1()))
}

/// Per-room collaborative apps state (spec §3: "Apps State").
pub struct AppsState {
    inner: Mutex<Inner>,
}

struct Inner {
    active_app_id: Option<String>,
    locked: bool,
    app_docs: HashMap<String, AppDoc>,
}

impl Default for AppsState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active_app_id: None,
                locked: false,
                app_docs: HashMap::new(),
            }),
        }
    }
}

impl AppsState {
    /// `apps:open{appId}`. Admin-gated at the dispatcher when `locked`
    /// (spec §3: "locked: when true, only admins may change active app").
    pub async fn open(&self, app_id: String) -> (Option<String>, bool) {
        let mut inner = self.inner.lock().await;
        inner.app_docs.entry(app_id.clone()).or_insert_with(AppDoc::new);
        inner.active_app_id = Some(app_id);
        (inner.active_app_id.clone(), inner.locked)
    }

    /// `apps:close`. Clears `activeAppId` and destroys the closed app's
    /// awareness state, returning a removal frame the caller must
    /// broadcast *before* the `apps:state` notification (spec §4.7:
    /// "emit a removal awareness update to subscribers before
    /// destroying"). The CRDT document itself is retained.
    pub async fn close(&self) -> (Option<String>, bool, Option<(String, AwarenessUpdate)>) {
        let mut inner = self.inner.lock().await;
        let closing_app_id = inner.active_app_id.take();
        let mut removal = None;
        if let Some(app_id) = &closing_app_id {
            if let Some(app) = inner.app_docs.get_mut(app_id) {
                removal = app.clear_awareness().map(|update| (app_id.clone(), update));
            }
        }
        (inner.active_app_id.clone(), inner.locked, removal)
    }

    pub async fn set_locked(&self, locked: bool) {
        self.inner.lock().await.locked = locked;
    }

    pub async fn state(&self) -> (Option<String>, bool) {
        let inner = self.inner.lock().await;
        (inner.active_app_id.clone(), inner.locked)
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.lock().await.locked
    }

    /// `apps:sync{appId, syncMessage}`. Applies an inbound sync-step/update
    /// frame and returns the current state vector plus any awareness
    /// snapshot to send back to the requester only (spec §4.7: "responds
    /// with current state vector and any awareness snapshot").
    pub async fn sync(&self, app_id: &str, message: SyncMessage) -> Result<(SyncMessage, Option<AwarenessUpdate>), ErrorKind> {
        let mut inner = self.inner.lock().await;
        let app = inner.app_docs.get_mut(app_id).ok_or(ErrorKind::NotFound)?;

        if let Ok(update) = Update::decode_v1(&message.0) {
            let mut txn = app.doc.transact_mut();
            txn.apply_update(update).map_err(|_| ErrorKind::NotFound)?;
        }

        let txn = app.doc.transact();
        let state_vector = txn.state_vector().encode_v1();
        drop(txn);

        let awareness = app.awareness.update().ok().map(|update| AwarenessUpdate(update.encode_v1()));

        Ok((SyncMessage(state_vector), awareness))
    }

    /// `apps:update{appId, update}` — a raw yjs update, broadcast verbatim
    /// to every other subscriber after being merged locally so the
    /// server's copy of the document stays authoritative.
    pub async fn apply_update(&self, app_id: &str, update: Vec<u8>) -> Result<(), ErrorKind> {
        let mut inner = self.inner.lock().await;
        let app = inner.app_docs.get_mut(app_id).ok_or(ErrorKind::NotFound)?;
        let decoded = Update::decode_v1(&update).map_err(|_| ErrorKind::NotFound)?;
        let mut txn = app.doc.transact_mut();
        txn.apply_update(decoded).map_err(|_| ErrorKind::NotFound)?;
        Ok(())
    }

    /// `apps:awareness{appId, awarenessUpdate, clientId?}`. Tracks the
    /// originating user's client ids so [`Self::gc_user`] can clear stale
    /// presence entries on disconnect.
    pub async fn apply_awareness(
        &self,
        app_id: &str,
        user_id: &UserId,
        client_id: Option<u64>,
        update: AwarenessUpdate,
    ) -> Result<(), ErrorKind> {
        let mut inner = self.inner.lock().await;
        let app = inner.app_docs.get_mut(app_id).ok_or(ErrorKind::NotFound)?;
        if let Ok(decoded) = YAwarenessUpdate::decode_v1(&update.0) {
            let _ = app.awareness.apply_update(decoded);
        }
        if let Some(client_id) = client_id {
            app.client_ids_by_user
                .entry(user_id.user_key.clone())
                .or_default()
                .insert(client_id);
        }
        Ok(())
    }

    /// Clear every awareness client-id entry belonging to `user_key` across
    /// all app documents, returning a synthesized removal frame per app
    /// that had any tracked state (spec §3/§4.7: "on disconnect the room
    /// emits a synthesized removal update for every tracked clientId").
    pub async fn gc_user(&self, user_key: &str) -> Vec<(String, AwarenessUpdate)> {
        let mut inner = self.inner.lock().await;
        let mut removals = Vec::new();
        for (app_id, app) in inner.app_docs.iter_mut() {
            if let Some(client_ids) = app.client_ids_by_user.remove(user_key) {
                if let Some(update) = encode_removal(&mut app.awareness, client_ids.into_iter().collect()) {
                    removals.push((app_id.clone(), update));
                }
            }
        }
        removals
    }
}
