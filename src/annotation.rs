//! Client-side store for user-drawn map annotations.
//!
//! The remote collaborator is the authority of record. Every mutation is
//! applied locally first, then confirmed or rolled back when the remote
//! answers. Each entry carries a version; an answer for an older version
//! than the entry's current one is stale and does not touch visible state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geo::{BoundingRect, Geometry, GeometryCollection, Rect};
use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{AnnotationError, RemoteError, StorageError};

const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub color: String,
    pub geometry: FeatureCollection,
    #[serde(default)]
    pub shared_with_team: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Annotation {
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn visible_to(&self, user: &str) -> bool {
        self.shared_with_team || self.owner_id == user
    }

    /// Geometries of every feature, converted for spatial work.
    pub fn geometries(&self) -> Result<Vec<Geometry<f64>>, AnnotationError> {
        validate_geometry(&self.geometry)
    }

    /// Bounding rectangle over all features, for fit-to-annotation.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        let geometries = self.geometries().ok()?;
        GeometryCollection::new_from(geometries).bounding_rect()
    }
}

/// What the user submits when saving a new shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub color: String,
    pub geometry: FeatureCollection,
    #[serde(default)]
    pub shared_with_team: bool,
}

/// Converts every feature and rejects empty collections, features without
/// geometry and anything other than points, lines and polygons.
fn validate_geometry(collection: &FeatureCollection) -> Result<Vec<Geometry<f64>>, AnnotationError> {
    if collection.features.is_empty() {
        return Err(AnnotationError::Validation("geometry has no features".into()));
    }
    let mut out = Vec::with_capacity(collection.features.len());
    for (i, feature) in collection.features.iter().enumerate() {
        let Some(gj) = &feature.geometry else {
            return Err(AnnotationError::Validation(format!("feature {i} has no geometry")));
        };
        let geom: Geometry<f64> = gj
            .value
            .clone()
            .try_into()
            .map_err(|e| AnnotationError::Validation(format!("feature {i}: {e}")))?;
        match geom {
            Geometry::Point(_)
            | Geometry::MultiPoint(_)
            | Geometry::LineString(_)
            | Geometry::MultiLineString(_)
            | Geometry::Polygon(_)
            | Geometry::MultiPolygon(_) => out.push(geom),
            other => {
                return Err(AnnotationError::Validation(format!(
                    "feature {i}: unsupported geometry {other:?}"
                )));
            }
        }
    }
    Ok(out)
}

/// Which annotations `list` returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListScope {
    Mine,
    Shared,
    All,
}

/// Remote persistence of annotations. `actor` is the user on whose behalf
/// the call is made; the remote enforces ownership on its own side too.
#[async_trait]
pub trait AnnotationRemote: Send + Sync {
    async fn create(&self, annotation: &Annotation) -> Result<Annotation, RemoteError>;
    async fn list(&self, viewer: &str) -> Result<Vec<Annotation>, RemoteError>;
    async fn fetch(&self, id: &str) -> Result<Annotation, RemoteError>;
    async fn rename(&self, actor: &str, id: &str, title: &str) -> Result<Annotation, RemoteError>;
    async fn set_shared(&self, actor: &str, id: &str, shared: bool) -> Result<Annotation, RemoteError>;
    async fn delete(&self, actor: &str, id: &str) -> Result<(), RemoteError>;
}

#[async_trait]
impl<T: AnnotationRemote + ?Sized> AnnotationRemote for Arc<T> {
    async fn create(&self, annotation: &Annotation) -> Result<Annotation, RemoteError> {
        (**self).create(annotation).await
    }

    async fn list(&self, viewer: &str) -> Result<Vec<Annotation>, RemoteError> {
        (**self).list(viewer).await
    }

    async fn fetch(&self, id: &str) -> Result<Annotation, RemoteError> {
        (**self).fetch(id).await
    }

    async fn rename(&self, actor: &str, id: &str, title: &str) -> Result<Annotation, RemoteError> {
        (**self).rename(actor, id, title).await
    }

    async fn set_shared(&self, actor: &str, id: &str, shared: bool) -> Result<Annotation, RemoteError> {
        (**self).set_shared(actor, id, shared).await
    }

    async fn delete(&self, actor: &str, id: &str) -> Result<(), RemoteError> {
        (**self).delete(actor, id).await
    }
}

// ── In-memory and file-backed remotes ──────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    annotations: BTreeMap<String, Annotation>,
    next_id: u64,
    calls: usize,
    fail_next: Option<RemoteError>,
}

/// Remote kept in memory. Shared between stores through an `Arc` it acts
/// like one server seen by several users.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    persist_to: Option<PathBuf>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote persisted as a JSON array at `path`, loaded if present.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let list: Vec<Annotation> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let next_id = list
            .iter()
            .filter_map(|a| a.id.strip_prefix("ann-")?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        let annotations = list.into_iter().map(|a| (a.id.clone(), a)).collect();
        Ok(Self {
            state: Mutex::new(MemoryState { annotations, next_id, ..Default::default() }),
            persist_to: Some(path),
        })
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().fail_next = Some(error);
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_call(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, RemoteError> {
        let mut state = self.lock();
        state.calls += 1;
        match state.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    /// Writes `annotations` to the backing file, if any. Callers change a
    /// copy and swap it in only after this succeeds, so a failed write
    /// leaves the remote unchanged.
    fn persist(&self, annotations: &BTreeMap<String, Annotation>) -> Result<(), RemoteError> {
        let Some(path) = &self.persist_to else {
            return Ok(());
        };
        let list: Vec<&Annotation> = annotations.values().collect();
        let bytes = serde_json::to_vec_pretty(&list).map_err(|e| RemoteError::Network(e.to_string()))?;
        fs::write(path, bytes).map_err(|e| RemoteError::Network(e.to_string()))
    }

    fn owned_mut<'a>(
        annotations: &'a mut BTreeMap<String, Annotation>,
        actor: &str,
        id: &str,
    ) -> Result<&'a mut Annotation, RemoteError> {
        let annotation = annotations
            .get_mut(id)
            .ok_or_else(|| RemoteError::Validation(format!("annotation {id} does not exist")))?;
        if annotation.owner_id != actor {
            return Err(RemoteError::Unauthorized(format!("{actor} does not own {id}")));
        }
        Ok(annotation)
    }

    fn update(
        &self,
        actor: &str,
        id: &str,
        change: impl FnOnce(&mut Annotation),
    ) -> Result<Annotation, RemoteError> {
        let mut state = self.begin_call()?;
        let mut staged = state.annotations.clone();
        let annotation = Self::owned_mut(&mut staged, actor, id)?;
        change(annotation);
        annotation.updated_at = Utc::now();
        let out = annotation.clone();
        self.persist(&staged)?;
        state.annotations = staged;
        Ok(out)
    }
}

#[async_trait]
impl AnnotationRemote for MemoryRemote {
    async fn create(&self, annotation: &Annotation) -> Result<Annotation, RemoteError> {
        let mut state = self.begin_call()?;
        validate_geometry(&annotation.geometry).map_err(|e| RemoteError::Validation(e.to_string()))?;
        let next_id = state.next_id + 1;
        let mut stored = annotation.clone();
        stored.id = format!("ann-{next_id}");
        stored.updated_at = Utc::now();
        let mut staged = state.annotations.clone();
        staged.insert(stored.id.clone(), stored.clone());
        self.persist(&staged)?;
        state.annotations = staged;
        state.next_id = next_id;
        Ok(stored)
    }

    async fn list(&self, viewer: &str) -> Result<Vec<Annotation>, RemoteError> {
        let state = self.begin_call()?;
        Ok(state
            .annotations
            .values()
            .filter(|a| a.visible_to(viewer))
            .cloned()
            .collect())
    }

    async fn fetch(&self, id: &str) -> Result<Annotation, RemoteError> {
        let state = self.begin_call()?;
        state
            .annotations
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::Validation(format!("annotation {id} does not exist")))
    }

    async fn rename(&self, actor: &str, id: &str, title: &str) -> Result<Annotation, RemoteError> {
        self.update(actor, id, |a| a.title = title.to_string())
    }

    async fn set_shared(&self, actor: &str, id: &str, shared: bool) -> Result<Annotation, RemoteError> {
        self.update(actor, id, |a| a.shared_with_team = shared)
    }

    async fn delete(&self, actor: &str, id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin_call()?;
        let mut staged = state.annotations.clone();
        Self::owned_mut(&mut staged, actor, id)?;
        staged.remove(id);
        self.persist(&staged)?;
        state.annotations = staged;
        Ok(())
    }
}

// ── Store ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Entry {
    /// What the user sees.
    current: Annotation,
    /// Last state the remote confirmed; `None` until the create round trip
    /// succeeds.
    confirmed: Option<Annotation>,
    /// Version whose answer produced `confirmed`. Older answers never
    /// replace a newer baseline.
    confirmed_version: u64,
    version: u64,
    /// Optimistically deleted, hidden until the remote answers.
    deleting: bool,
    /// Number of mutations waiting on the remote.
    in_flight: usize,
}

#[derive(Clone, Debug, PartialEq)]
enum Mutation {
    Create,
    Rename,
    SetShared,
    Delete,
}

/// Proof of an optimistic change, handed back with the remote's answer.
#[derive(Clone, Debug, PartialEq)]
pub struct Ticket {
    id: String,
    version: u64,
    mutation: Mutation,
}

impl Ticket {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// What the remote said about a ticket.
#[derive(Clone, Debug)]
pub enum RemoteOutcome {
    Saved(Annotation),
    Deleted,
    Failed(RemoteError),
}

/// How [`AnnotationStore::resolve`] treated an answer.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// The local state now matches the remote.
    Confirmed(Option<Annotation>),
    /// The answer was for an older change. It can only move the known-good
    /// baseline forward.
    Superseded,
}

pub struct AnnotationStore<R: AnnotationRemote> {
    remote: R,
    current_user: String,
    entries: BTreeMap<String, Entry>,
    next_version: u64,
}

impl<R: AnnotationRemote> AnnotationStore<R> {
    pub fn new(remote: R, current_user: impl Into<String>) -> Self {
        Self {
            remote,
            current_user: current_user.into(),
            entries: BTreeMap::new(),
            next_version: 0,
        }
    }

    pub fn current_user(&self) -> &str {
        &self.current_user
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    pub fn get(&self, id: &str) -> Option<&Annotation> {
        self.entries.get(id).filter(|e| !e.deleting).map(|e| &e.current)
    }

    /// Visible annotations, oldest first.
    pub fn list(&self, scope: ListScope) -> Vec<Annotation> {
        let user = self.current_user.as_str();
        let mut out: Vec<Annotation> = self
            .entries
            .values()
            .filter(|e| !e.deleting)
            .map(|e| &e.current)
            .filter(|a| match scope {
                ListScope::Mine => a.owner_id == user,
                ListScope::Shared => a.shared_with_team,
                ListScope::All => a.owner_id == user || a.shared_with_team,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    // ── two-phase API ──

    /// Adds the draft under a temporary id and returns the annotation to
    /// send to the remote.
    pub fn begin_create(&mut self, draft: AnnotationDraft) -> Result<(Ticket, Annotation), AnnotationError> {
        if draft.title.trim().is_empty() {
            return Err(AnnotationError::Validation("title is empty".into()));
        }
        validate_geometry(&draft.geometry)?;
        let now = Utc::now();
        let id = format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4());
        let annotation = Annotation {
            id: id.clone(),
            owner_id: self.current_user.clone(),
            title: draft.title,
            description: draft.description,
            color: draft.color,
            geometry: draft.geometry,
            shared_with_team: draft.shared_with_team,
            created_at: now,
            updated_at: now,
        };
        let version = self.bump();
        self.entries.insert(
            id.clone(),
            Entry {
                current: annotation.clone(),
                confirmed: None,
                confirmed_version: 0,
                version,
                deleting: false,
                in_flight: 1,
            },
        );
        Ok((Ticket { id, version, mutation: Mutation::Create }, annotation))
    }

    /// Ownership and confirmation checks shared by every mutation. Runs
    /// before anything changes or goes over the network.
    fn authorize(&self, id: &str) -> Result<(), AnnotationError> {
        let entry = self
            .entries
            .get(id)
            .filter(|e| !e.deleting)
            .ok_or_else(|| AnnotationError::NotFound(id.to_string()))?;
        if entry.current.owner_id != self.current_user {
            return Err(AnnotationError::Unauthorized {
                id: id.to_string(),
                user: self.current_user.clone(),
            });
        }
        if entry.confirmed.is_none() {
            return Err(AnnotationError::Pending(id.to_string()));
        }
        Ok(())
    }

    fn begin_mutation(
        &mut self,
        id: &str,
        mutation: Mutation,
        apply: impl FnOnce(&mut Entry),
    ) -> Result<Ticket, AnnotationError> {
        self.authorize(id)?;
        let version = self.bump();
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| AnnotationError::NotFound(id.to_string()))?;
        apply(entry);
        entry.version = version;
        entry.in_flight += 1;
        Ok(Ticket { id: id.to_string(), version, mutation })
    }

    pub fn begin_rename(&mut self, id: &str, title: &str) -> Result<Ticket, AnnotationError> {
        if title.trim().is_empty() {
            return Err(AnnotationError::Validation("title is empty".into()));
        }
        let title = title.to_string();
        self.begin_mutation(id, Mutation::Rename, move |e| {
            e.current.title = title;
            e.current.updated_at = Utc::now();
        })
    }

    pub fn begin_set_shared(&mut self, id: &str, shared: bool) -> Result<Ticket, AnnotationError> {
        self.begin_mutation(id, Mutation::SetShared, move |e| {
            e.current.shared_with_team = shared;
            e.current.updated_at = Utc::now();
        })
    }

    pub fn begin_delete(&mut self, id: &str) -> Result<Ticket, AnnotationError> {
        self.begin_mutation(id, Mutation::Delete, |e| e.deleting = true)
    }

    /// Applies the remote's answer to a ticket.
    ///
    /// A failure on the latest version rolls the entry back to its last
    /// confirmed state (or drops it, for a create) and returns the error.
    /// Answers for superseded versions never change what the user sees.
    pub fn resolve(&mut self, ticket: Ticket, outcome: RemoteOutcome) -> Result<Resolution, AnnotationError> {
        let Some(entry) = self.entries.get_mut(&ticket.id) else {
            tracing::debug!(id = %ticket.id, "answer for an annotation no longer held");
            return Ok(Resolution::Superseded);
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);

        if entry.version != ticket.version {
            match outcome {
                RemoteOutcome::Deleted => {
                    self.entries.remove(&ticket.id);
                    tracing::info!(id = %ticket.id, "annotation deleted");
                    return Ok(Resolution::Confirmed(None));
                }
                RemoteOutcome::Saved(server) if ticket.version > entry.confirmed_version => {
                    entry.confirmed = Some(server.clone());
                    entry.confirmed_version = ticket.version;
                    // Every newer change failed and was rolled back, so the
                    // server copy is what the user should see.
                    if entry.in_flight == 0 {
                        entry.current = server;
                        entry.deleting = false;
                    }
                }
                _ => {}
            }
            tracing::debug!(
                id = %ticket.id,
                ticket = ticket.version,
                current = entry.version,
                "discarding stale annotation response"
            );
            return Ok(Resolution::Superseded);
        }

        match (ticket.mutation, outcome) {
            (Mutation::Create, RemoteOutcome::Saved(server)) => {
                let mut entry = self
                    .entries
                    .remove(&ticket.id)
                    .ok_or_else(|| AnnotationError::NotFound(ticket.id.clone()))?;
                entry.current = server.clone();
                entry.confirmed = Some(server.clone());
                entry.confirmed_version = ticket.version;
                self.entries.insert(server.id.clone(), entry);
                tracing::info!(local = %ticket.id, id = %server.id, "annotation created");
                Ok(Resolution::Confirmed(Some(server)))
            }
            (Mutation::Delete, RemoteOutcome::Deleted) => {
                self.entries.remove(&ticket.id);
                tracing::info!(id = %ticket.id, "annotation deleted");
                Ok(Resolution::Confirmed(None))
            }
            (_, RemoteOutcome::Saved(server)) => {
                entry.current = server.clone();
                entry.confirmed = Some(server.clone());
                entry.confirmed_version = ticket.version;
                Ok(Resolution::Confirmed(Some(server)))
            }
            (_, RemoteOutcome::Deleted) => Err(AnnotationError::Validation(format!(
                "unexpected delete confirmation for {}",
                ticket.id
            ))),
            (mutation, RemoteOutcome::Failed(err)) => {
                match entry.confirmed.clone() {
                    Some(good) => {
                        entry.current = good;
                        entry.deleting = false;
                    }
                    None => {
                        self.entries.remove(&ticket.id);
                    }
                }
                tracing::warn!(id = %ticket.id, ?mutation, error = %err, "annotation change rolled back");
                Err(AnnotationError::Remote(err))
            }
        }
    }

    // ── async convenience ──

    /// Optimistically creates an annotation and waits for the remote to
    /// assign its id.
    pub async fn create(&mut self, draft: AnnotationDraft) -> Result<Annotation, AnnotationError> {
        let (ticket, annotation) = self.begin_create(draft)?;
        let outcome = match self.remote.create(&annotation).await {
            Ok(saved) => RemoteOutcome::Saved(saved),
            Err(e) => RemoteOutcome::Failed(e),
        };
        match self.resolve(ticket, outcome)? {
            Resolution::Confirmed(Some(saved)) => Ok(saved),
            _ => Ok(annotation),
        }
    }

    pub async fn rename(&mut self, id: &str, title: &str) -> Result<(), AnnotationError> {
        let ticket = self.begin_rename(id, title)?;
        let outcome = saved_or_failed(self.remote.rename(&self.current_user, id, title).await);
        self.resolve(ticket, outcome).map(|_| ())
    }

    pub async fn set_shared(&mut self, id: &str, shared: bool) -> Result<(), AnnotationError> {
        let ticket = self.begin_set_shared(id, shared)?;
        let outcome = saved_or_failed(self.remote.set_shared(&self.current_user, id, shared).await);
        self.resolve(ticket, outcome).map(|_| ())
    }

    pub async fn delete(&mut self, id: &str) -> Result<(), AnnotationError> {
        let ticket = self.begin_delete(id)?;
        let outcome = match self.remote.delete(&self.current_user, id).await {
            Ok(()) => RemoteOutcome::Deleted,
            Err(e) => RemoteOutcome::Failed(e),
        };
        self.resolve(ticket, outcome).map(|_| ())
    }

    /// Replaces the local copy with the stored one, geometry included.
    /// An entry with changes in flight keeps its local state; their answers
    /// settle it.
    pub async fn load(&mut self, id: &str) -> Result<Annotation, AnnotationError> {
        let stored = self.remote.fetch(id).await?;
        if !stored.visible_to(&self.current_user) {
            return Err(AnnotationError::NotFound(id.to_string()));
        }
        if self.entries.get(id).is_some_and(|e| e.in_flight > 0) {
            tracing::debug!(id, "annotation busy, keeping local state");
            return Ok(stored);
        }
        let version = self.bump();
        self.entries.insert(
            id.to_string(),
            Entry {
                current: stored.clone(),
                confirmed: Some(stored.clone()),
                confirmed_version: version,
                version,
                deleting: false,
                in_flight: 0,
            },
        );
        Ok(stored)
    }

    /// Pulls everything visible to the current user from the remote.
    /// Entries with changes in flight keep their local state.
    pub async fn sync(&mut self) -> Result<usize, AnnotationError> {
        let remote = self.remote.list(&self.current_user).await?;
        let mut fresh: BTreeMap<String, Entry> = BTreeMap::new();
        for annotation in remote {
            let version = self.bump();
            fresh.insert(
                annotation.id.clone(),
                Entry {
                    current: annotation.clone(),
                    confirmed: Some(annotation),
                    confirmed_version: version,
                    version,
                    deleting: false,
                    in_flight: 0,
                },
            );
        }
        for (id, entry) in std::mem::take(&mut self.entries) {
            if entry.in_flight > 0 {
                fresh.insert(id, entry);
            }
        }
        self.entries = fresh;
        let count = self.entries.len();
        tracing::debug!(count, "annotations synced");
        Ok(count)
    }
}

fn saved_or_failed(result: Result<Annotation, RemoteError>) -> RemoteOutcome {
    match result {
        Ok(saved) => RemoteOutcome::Saved(saved),
        Err(e) => RemoteOutcome::Failed(e),
    }
}

/// A one-feature collection holding a single point.
pub fn point_geometry(lat: f64, lng: f64) -> FeatureCollection {
    let geometry = geojson::Geometry::new(geojson::Value::Point(vec![lng, lat]));
    FeatureCollection {
        bbox: None,
        features: vec![geojson::Feature::from(geometry)],
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geojson::{Feature, Value};

    fn draft(title: &str) -> AnnotationDraft {
        AnnotationDraft {
            title: title.to_string(),
            description: None,
            color: "#e4572e".to_string(),
            geometry: point_geometry(33.749, -84.388),
            shared_with_team: false,
        }
    }

    fn store(user: &str, remote: &Arc<MemoryRemote>) -> AnnotationStore<Arc<MemoryRemote>> {
        AnnotationStore::new(Arc::clone(remote), user)
    }

    #[tokio::test]
    async fn create_swaps_the_temporary_id_for_the_server_id() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("Comps")).await.unwrap();
        assert_eq!(saved.id, "ann-1");
        assert!(!saved.is_local());
        let listed = a.list(ListScope::Mine);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "ann-1");
    }

    #[tokio::test]
    async fn failed_create_rolls_back() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        remote.fail_next(RemoteError::Network("offline".into()));
        let err = a.create(draft("Comps")).await.unwrap_err();
        assert_eq!(err, AnnotationError::Remote(RemoteError::Network("offline".into())));
        assert!(a.list(ListScope::All).is_empty());
    }

    #[tokio::test]
    async fn empty_geometry_is_rejected_without_a_call() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let mut bad = draft("Nothing");
        bad.geometry.features.clear();
        assert!(matches!(a.create(bad).await, Err(AnnotationError::Validation(_))));

        let mut no_geom = draft("Nothing");
        no_geom.geometry.features = vec![Feature {
            bbox: None,
            geometry: None,
            id: None,
            properties: None,
            foreign_members: None,
        }];
        assert!(matches!(a.create(no_geom).await, Err(AnnotationError::Validation(_))));
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn sharing_makes_an_annotation_visible_to_the_team() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let mut b = store("bo", &remote);
        let saved = a.create(draft("Submarket")).await.unwrap();

        b.sync().await.unwrap();
        assert!(b.list(ListScope::All).iter().all(|x| x.id != saved.id));

        a.set_shared(&saved.id, true).await.unwrap();
        b.sync().await.unwrap();
        assert!(b.list(ListScope::All).iter().any(|x| x.id == saved.id));
        assert!(b.list(ListScope::Mine).is_empty());
    }

    #[tokio::test]
    async fn non_owners_cannot_mutate_and_no_call_is_made() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let mut b = store("bo", &remote);
        let mut shared = draft("Shared");
        shared.shared_with_team = true;
        let saved = a.create(shared).await.unwrap();
        b.sync().await.unwrap();

        let before = b.list(ListScope::All);
        let calls = remote.calls();
        assert!(matches!(b.rename(&saved.id, "Mine now").await, Err(AnnotationError::Unauthorized { .. })));
        assert!(matches!(b.set_shared(&saved.id, false).await, Err(AnnotationError::Unauthorized { .. })));
        assert!(matches!(b.delete(&saved.id).await, Err(AnnotationError::Unauthorized { .. })));
        assert_eq!(remote.calls(), calls);
        assert_eq!(b.list(ListScope::All), before);
    }

    #[tokio::test]
    async fn failed_rename_restores_the_confirmed_title() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("Before")).await.unwrap();
        remote.fail_next(RemoteError::Network("timeout".into()));
        assert!(a.rename(&saved.id, "After").await.is_err());
        assert_eq!(a.get(&saved.id).map(|x| x.title.as_str()), Some("Before"));
    }

    #[tokio::test]
    async fn failed_delete_brings_the_annotation_back() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("Keep")).await.unwrap();
        remote.fail_next(RemoteError::Network("timeout".into()));
        assert!(a.delete(&saved.id).await.is_err());
        assert!(a.get(&saved.id).is_some());
        a.delete(&saved.id).await.unwrap();
        assert!(a.get(&saved.id).is_none());
        assert!(a.list(ListScope::All).is_empty());
    }

    #[tokio::test]
    async fn stale_answers_are_discarded() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("v0")).await.unwrap();

        let first = a.begin_rename(&saved.id, "v1").unwrap();
        let second = a.begin_rename(&saved.id, "v2").unwrap();
        assert_eq!(a.get(&saved.id).unwrap().title, "v2");

        // The older request fails after the newer one was issued.
        let stale = a.resolve(first, RemoteOutcome::Failed(RemoteError::Network("late".into())));
        assert_eq!(stale, Ok(Resolution::Superseded));
        assert_eq!(a.get(&saved.id).unwrap().title, "v2");

        let mut confirmed = saved.clone();
        confirmed.title = "v2".into();
        let done = a.resolve(second, RemoteOutcome::Saved(confirmed.clone())).unwrap();
        assert_eq!(done, Resolution::Confirmed(Some(confirmed)));
    }

    #[tokio::test]
    async fn stale_success_moves_the_rollback_baseline() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("v0")).await.unwrap();

        let first = a.begin_rename(&saved.id, "v1").unwrap();
        let second = a.begin_rename(&saved.id, "v2").unwrap();
        let mut v1 = saved.clone();
        v1.title = "v1".into();
        a.resolve(first, RemoteOutcome::Saved(v1)).unwrap();
        assert!(a.resolve(second, RemoteOutcome::Failed(RemoteError::Network("x".into()))).is_err());
        assert_eq!(a.get(&saved.id).unwrap().title, "v1");
    }

    fn titled(base: &Annotation, title: &str) -> Annotation {
        let mut a = base.clone();
        a.title = title.into();
        a
    }

    #[tokio::test]
    async fn late_older_success_does_not_rewind_the_baseline() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("v0")).await.unwrap();

        let first = a.begin_rename(&saved.id, "v1").unwrap();
        let second = a.begin_rename(&saved.id, "v2").unwrap();
        a.resolve(second, RemoteOutcome::Saved(titled(&saved, "v2"))).unwrap();
        let late = a.resolve(first, RemoteOutcome::Saved(titled(&saved, "v1"))).unwrap();
        assert_eq!(late, Resolution::Superseded);
        assert_eq!(a.get(&saved.id).unwrap().title, "v2");

        let share = a.begin_set_shared(&saved.id, true).unwrap();
        assert!(a.resolve(share, RemoteOutcome::Failed(RemoteError::Network("x".into()))).is_err());
        let shown = a.get(&saved.id).unwrap();
        assert_eq!(shown.title, "v2");
        assert!(!shown.shared_with_team);
    }

    #[tokio::test]
    async fn success_arriving_after_a_rollback_is_shown() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("v0")).await.unwrap();

        let rename = a.begin_rename(&saved.id, "v1").unwrap();
        let share = a.begin_set_shared(&saved.id, true).unwrap();
        assert!(a.resolve(share, RemoteOutcome::Failed(RemoteError::Network("x".into()))).is_err());
        assert_eq!(a.get(&saved.id).unwrap().title, "v0");

        a.resolve(rename, RemoteOutcome::Saved(titled(&saved, "v1"))).unwrap();
        let shown = a.get(&saved.id).unwrap();
        assert_eq!(shown.title, "v1");
        assert!(!shown.shared_with_team);
    }

    #[tokio::test]
    async fn load_during_a_pending_delete_does_not_resurrect() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("Gone")).await.unwrap();

        let ticket = a.begin_delete(&saved.id).unwrap();
        a.load(&saved.id).await.unwrap();
        assert!(a.get(&saved.id).is_none());

        assert_eq!(a.resolve(ticket, RemoteOutcome::Deleted), Ok(Resolution::Confirmed(None)));
        assert!(a.list(ListScope::All).is_empty());
    }

    #[tokio::test]
    async fn temporary_ids_are_unique_uuids() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let (_, first) = a.begin_create(draft("one")).unwrap();
        let (_, second) = a.begin_create(draft("two")).unwrap();
        assert_ne!(first.id, second.id);
        let suffix = first.id.strip_prefix(LOCAL_ID_PREFIX).unwrap();
        assert!(Uuid::parse_str(suffix).is_ok());
    }

    #[tokio::test]
    async fn failed_write_leaves_the_remote_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotations.json");
        let remote = Arc::new(MemoryRemote::open_file(&path).unwrap());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("Kept")).await.unwrap();

        // A directory in place of the file makes every write fail.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(a.rename(&saved.id, "Lost").await.is_err());
        assert!(a.delete(&saved.id).await.is_err());
        assert!(a.create(draft("Also lost")).await.is_err());
        assert_eq!(a.get(&saved.id).unwrap().title, "Kept");

        let stored = remote.list("ana").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "Kept");

        fs::remove_dir(&path).unwrap();
        let next = a.create(draft("Next")).await.unwrap();
        assert_eq!(next.id, "ann-2");
    }

    #[tokio::test]
    async fn unconfirmed_annotations_cannot_be_mutated() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let (_ticket, local) = a.begin_create(draft("Draft")).unwrap();
        assert!(local.is_local());
        assert_eq!(a.begin_rename(&local.id, "x"), Err(AnnotationError::Pending(local.id.clone())));
    }

    #[tokio::test]
    async fn load_replaces_local_geometry_with_the_stored_one() {
        let remote = Arc::new(MemoryRemote::new());
        let mut a = store("ana", &remote);
        let saved = a.create(draft("Site")).await.unwrap();

        let mut b = store("bo", &remote);
        let err = b.load(&saved.id).await.unwrap_err();
        assert_eq!(err, AnnotationError::NotFound(saved.id.clone()));

        let loaded = a.load(&saved.id).await.unwrap();
        let geometries = loaded.geometries().unwrap();
        assert_eq!(geometries.len(), 1);
        assert_eq!(a.get(&saved.id), Some(&loaded));
    }

    #[test]
    fn list_all_is_union_of_mine_and_shared_without_duplicates() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let remote = Arc::new(MemoryRemote::new());
            let mut a = store("ana", &remote);
            let mut b = store("bo", &remote);
            let mut shared_mine = draft("mine+shared");
            shared_mine.shared_with_team = true;
            a.create(shared_mine).await.unwrap();
            a.create(draft("mine")).await.unwrap();
            let mut theirs = draft("theirs");
            theirs.shared_with_team = true;
            b.create(theirs).await.unwrap();
            b.create(draft("private")).await.unwrap();
            a.sync().await.unwrap();

            let all = a.list(ListScope::All);
            assert_eq!(all.len(), 3);
            let mut ids: Vec<&str> = all.iter().map(|x| x.id.as_str()).collect();
            ids.dedup();
            assert_eq!(ids.len(), 3);
            assert_eq!(a.list(ListScope::Mine).len(), 2);
            assert_eq!(a.list(ListScope::Shared).len(), 2);
        });
    }

    #[test]
    fn bounds_cover_all_features() {
        let line = geojson::Geometry::new(Value::LineString(vec![vec![-84.5, 33.6], vec![-84.2, 33.9]]));
        let mut geometry = point_geometry(34.0, -84.0);
        geometry.features.push(Feature::from(line));
        let annotation = Annotation {
            id: "ann-1".into(),
            owner_id: "ana".into(),
            title: "Corridor".into(),
            description: None,
            color: "#000".into(),
            geometry,
            shared_with_team: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let rect = annotation.bounds().unwrap();
        assert_eq!(rect.min().x, -84.5);
        assert_eq!(rect.max().y, 34.0);
    }

    #[tokio::test]
    async fn file_remote_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotations.json");
        {
            let remote = Arc::new(MemoryRemote::open_file(&path).unwrap());
            let mut a = store("ana", &remote);
            a.create(draft("Durable")).await.unwrap();
        }
        let remote = Arc::new(MemoryRemote::open_file(&path).unwrap());
        let mut a = store("ana", &remote);
        assert_eq!(a.sync().await.unwrap(), 1);
        assert_eq!(a.list(ListScope::Mine)[0].title, "Durable");
    }
}
