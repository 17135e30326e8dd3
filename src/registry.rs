//! Camera id → at most one live worker.
//!
//! `get_or_create` holds the registry lock across the whole check-and-spawn, so two
//! viewers racing on the same URL end up on the same worker. Lock order is
//! registry → store; workers never take the registry lock while holding the store.
//!
//! Release is not reference counted: any one viewer that times out or disconnects stops
//! the camera's worker even if other viewers are attached. Viewers still watching see
//! their feed end and re-request, which starts a fresh session. A feed releases by
//! session (`release_session`), so a late exit never stops a newer session.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::ingest::SourceConnector;
use crate::pipeline::PipelineFactory;
use crate::storage::{CameraRecord, SharedStore};
use crate::worker::{StopReason, WorkerHandle, WorkerSettings};
use crate::{CameraId, FootfallError};

/// Upper bound on waiting for a stopping worker to drop its connection.
const STOPPING_WORKER_WAIT: Duration = Duration::from_secs(2);

struct RegistryInner {
    workers: Mutex<HashMap<CameraId, WorkerHandle>>,
    connector: Arc<dyn SourceConnector>,
    pipelines: Arc<dyn PipelineFactory>,
    store: SharedStore,
    settings: WorkerSettings,
    branches: BTreeMap<String, Vec<String>>,
    next_session: AtomicU64,
}

/// Explicitly owned service; clone to share with request handlers.
#[derive(Clone)]
pub struct CameraRegistry {
    inner: Arc<RegistryInner>,
}

impl CameraRegistry {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        pipelines: Arc<dyn PipelineFactory>,
        store: SharedStore,
        settings: WorkerSettings,
    ) -> Self {
        Self::with_branches(connector, pipelines, store, settings, BTreeMap::new())
    }

    /// Branch map used to label camera records created on first sight.
    pub fn with_branches(
        connector: Arc<dyn SourceConnector>,
        pipelines: Arc<dyn PipelineFactory>,
        store: SharedStore,
        settings: WorkerSettings,
        branches: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                workers: Mutex::new(HashMap::new()),
                connector,
                pipelines,
                store,
                settings,
                branches,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    /// Existing live worker for the URL's camera, or a newly started one.
    ///
    /// A registered worker that is stopping is waited on (outside the lock, up to
    /// `STOPPING_WORKER_WAIT`) before its replacement connects.
    pub fn get_or_create(&self, url: &str) -> Result<WorkerHandle> {
        let camera = CameraId::from_url(url)?;
        let url = crate::normalize_source_url(url);
        loop {
            let mut workers = self
                .inner
                .workers
                .lock()
                .map_err(|_| anyhow!("camera registry lock poisoned"))?;

            if let Some(existing) = workers.get(&camera).filter(|w| w.is_alive()) {
                existing.touch();
                return Ok(existing.clone());
            }
            // Its own exit hook will not remove a replacement: the session differs.
            if let Some(stale) = workers.remove(&camera) {
                drop(workers);
                stale.stop(StopReason::Released);
                wait_for_exit(&stale);
                continue;
            }

            self.register_camera(&camera, url)?;
            let source = self.inner.connector.open(url)?;
            let pipeline = self.inner.pipelines.build(&camera)?;
            let session = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
            let registry = Arc::downgrade(&self.inner);
            let handle = WorkerHandle::spawn(
                camera.clone(),
                session,
                source,
                pipeline,
                self.inner.store.clone(),
                self.inner.settings.clone(),
                Box::new(move |camera, session| deregister(&registry, camera, session)),
            )?;
            log::info!("registry: started {} (session {})", camera, session);
            workers.insert(camera, handle.clone());
            return Ok(handle);
        }
    }

    fn register_camera(&self, camera: &CameraId, url: &str) -> Result<()> {
        let mut store = self
            .inner
            .store
            .lock()
            .map_err(|_| anyhow!("count store lock poisoned"))?;
        match store.camera_active(camera)? {
            Some(true) => Ok(()),
            Some(false) => Err(FootfallError::UnknownCamera(format!("{} is deactivated", camera)).into()),
            None => {
                let branch = branch_of(&self.inner.branches, url);
                store.ensure_camera(&CameraRecord::new(camera.clone(), url, branch))
            }
        }
    }

    /// Live worker for `camera`, if any. Does not start one.
    pub fn get(&self, camera: &CameraId) -> Result<Option<WorkerHandle>> {
        let workers = self
            .inner
            .workers
            .lock()
            .map_err(|_| anyhow!("camera registry lock poisoned"))?;
        Ok(workers.get(camera).filter(|w| w.is_alive()).cloned())
    }

    /// Stop and forget the camera's worker, whatever its session. No-op if none is
    /// registered. Returns once the worker has exited or `STOPPING_WORKER_WAIT` elapsed.
    pub fn release(&self, camera: &CameraId) -> Result<()> {
        self.release_matching(camera, None)
    }

    /// Like `release`, but only if the camera is still served by `session`.
    pub fn release_session(&self, camera: &CameraId, session: u64) -> Result<()> {
        self.release_matching(camera, Some(session))
    }

    fn release_matching(&self, camera: &CameraId, session: Option<u64>) -> Result<()> {
        let removed = {
            let mut workers = self
                .inner
                .workers
                .lock()
                .map_err(|_| anyhow!("camera registry lock poisoned"))?;
            let matches = match (workers.get(camera), session) {
                (Some(worker), Some(session)) => worker.session() == session,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                workers.remove(camera)
            } else {
                None
            }
        };
        if let Some(worker) = removed {
            log::info!("registry: releasing {} (session {})", camera, worker.session());
            worker.stop(StopReason::Released);
            wait_for_exit(&worker);
        }
        Ok(())
    }

    pub fn active_cameras(&self) -> Result<Vec<CameraId>> {
        let workers = self
            .inner
            .workers
            .lock()
            .map_err(|_| anyhow!("camera registry lock poisoned"))?;
        let mut ids: Vec<CameraId> = workers
            .iter()
            .filter(|(_, w)| w.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Stop every worker and wait for the threads to exit.
    pub fn shutdown(&self) -> Result<()> {
        let drained: Vec<WorkerHandle> = self
            .inner
            .workers
            .lock()
            .map_err(|_| anyhow!("camera registry lock poisoned"))?
            .drain()
            .map(|(_, worker)| worker)
            .collect();
        for worker in &drained {
            worker.stop(StopReason::Shutdown);
        }
        for worker in drained {
            if let Err(err) = worker.join() {
                log::error!("registry: {:#}", err);
            }
        }
        log::info!("registry: drained");
        Ok(())
    }
}

fn wait_for_exit(worker: &WorkerHandle) {
    if !worker.wait_finished(STOPPING_WORKER_WAIT) {
        log::warn!(
            "registry: {} (session {}) still closing after {:?}",
            worker.camera_id(),
            worker.session(),
            STOPPING_WORKER_WAIT
        );
    }
}

fn branch_of<'a>(branches: &'a BTreeMap<String, Vec<String>>, url: &str) -> Option<&'a str> {
    branches.iter().find_map(|(branch, urls)| {
        urls.iter()
            .any(|candidate| crate::normalize_source_url(candidate) == url)
            .then_some(branch.as_str())
    })
}

/// Remove `camera` only if the registry still maps it to this session.
fn deregister(registry: &Weak<RegistryInner>, camera: &CameraId, session: u64) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let Ok(mut workers) = inner.workers.lock() else {
        log::error!("registry: lock poisoned while deregistering {}", camera);
        return;
    };
    if workers.get(camera).map(|w| w.session()) == Some(session) {
        workers.remove(camera);
        log::debug!("registry: {} (session {}) deregistered", camera, session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::Annotator;
    use crate::detect::StubDetector;
    use crate::ingest::DefaultConnector;
    use crate::pipeline::DetectionPipeline;
    use crate::storage::{shared_store, InMemoryCountStore};
    use crate::track::IouTracker;
    use crate::classify;

    fn registry() -> CameraRegistry {
        let pipelines = |_: &CameraId| -> Result<DetectionPipeline> {
            Ok(DetectionPipeline::new(
                Box::new(StubDetector::new()),
                Box::new(IouTracker::default()),
                Arc::new(Annotator::boxes_only()),
                0.25,
                100,
            ))
        };
        let mut branches = BTreeMap::new();
        branches.insert("north".to_string(), vec!["stub://reg-a?width=8&height=8".to_string()]);
        CameraRegistry::with_branches(
            Arc::new(DefaultConnector::default()),
            Arc::new(pipelines),
            shared_store(InMemoryCountStore::new()),
            WorkerSettings {
                frame_pacing: Duration::from_millis(5),
                ..WorkerSettings::default()
            },
            branches,
        )
    }

    #[test]
    fn same_url_shares_one_worker() -> Result<()> {
        let registry = registry();
        let a = registry.get_or_create("stub://reg-a?width=8&height=8")?;
        let b = registry.get_or_create(" stub://reg-a?width=8&height=8 ")?;
        assert_eq!(a.session(), b.session());
        assert_eq!(registry.active_cameras()?.len(), 1);

        let cameras = registry.store().lock().unwrap().cameras()?;
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].branch.as_deref(), Some("north"));
        registry.shutdown()
    }

    #[test]
    fn release_starts_a_new_session_next_time() -> Result<()> {
        let registry = registry();
        let first = registry.get_or_create("stub://reg-b?width=8&height=8")?;
        registry.release(first.camera_id())?;
        assert!(!first.is_alive());
        assert!(registry.get(first.camera_id())?.is_none());

        let second = registry.get_or_create("stub://reg-b?width=8&height=8")?;
        assert_ne!(first.session(), second.session());
        first.join()?;
        // The old session's exit hook must not evict the new worker.
        assert_eq!(
            registry.get(second.camera_id())?.map(|w| w.session()),
            Some(second.session())
        );
        registry.shutdown()
    }

    #[test]
    fn release_session_ignores_other_sessions() -> Result<()> {
        let registry = registry();
        let worker = registry.get_or_create("stub://reg-f?width=8&height=8")?;
        registry.release_session(worker.camera_id(), worker.session() + 100)?;
        assert!(worker.is_alive());

        registry.release_session(worker.camera_id(), worker.session())?;
        assert!(worker.is_finished());
        assert!(registry.get(worker.camera_id())?.is_none());
        registry.shutdown()
    }

    #[test]
    fn deactivated_camera_is_refused() -> Result<()> {
        let registry = registry();
        let url = "stub://reg-c?width=8&height=8";
        let handle = registry.get_or_create(url)?;
        registry.release(handle.camera_id())?;
        registry
            .store()
            .lock()
            .unwrap()
            .set_camera_active(handle.camera_id(), false)?;

        let err = registry.get_or_create(url).unwrap_err();
        assert!(matches!(classify(&err), Some(FootfallError::UnknownCamera(_))));
        registry.shutdown()
    }

    #[test]
    fn shutdown_joins_every_worker() -> Result<()> {
        let registry = registry();
        let a = registry.get_or_create("stub://reg-d?width=8&height=8")?;
        let b = registry.get_or_create("stub://reg-e?width=8&height=8")?;
        registry.shutdown()?;
        assert!(a.is_finished() && b.is_finished());
        assert_eq!(a.stop_reason(), Some(StopReason::Shutdown));
        assert!(registry.active_cameras()?.is_empty());
        Ok(())
    }
}
