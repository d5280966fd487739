use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::{Camera, Portrait};
use crate::error::BoothError;
use crate::gallery::Gallery;
use crate::llm::VisionBackend;
use crate::workflow::{Effect, Event, Notice, RequestId, Stage, Workflow};

pub type CameraFactory = Box<dyn FnMut() -> Result<Camera, BoothError> + Send>;

pub struct Session {
    workflow: Workflow,
    backend: Arc<dyn VisionBackend>,
    gallery: Gallery,
    camera_factory: Option<CameraFactory>,
    camera: Option<Camera>,
    in_flight: Option<(RequestId, JoinHandle<()>)>,
    completions: mpsc::UnboundedSender<Event>,
}

impl Session {
    pub fn new(
        backend: Arc<dyn VisionBackend>,
        gallery: Gallery,
        camera_factory: Option<CameraFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (completions, receiver) = mpsc::unbounded_channel();
        info!("Session started with {} backend", backend.name());
        let session = Session {
            workflow: Workflow::new(),
            backend,
            gallery,
            camera_factory,
            camera: None,
            in_flight: None,
            completions,
        };
        (session, receiver)
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn camera_open(&self) -> bool {
        self.camera.is_some()
    }

    pub async fn dispatch(&mut self, event: Event) -> Vec<Notice> {
        let transition = self.workflow.handle(event);
        let mut notices = Vec::new();
        for effect in transition.effects {
            self.run_effect(effect, &mut notices).await;
        }
        self.cancel_abandoned();
        notices
    }


    pub async fn snap(&mut self) -> Vec<Notice> {
        let Some(camera) = self.camera.as_mut() else {
            return vec![Notice::Warning(
                "No camera is open; upload a portrait file instead.".to_string(),
            )];
        };
        let event = match camera.capture() {
            Ok(portrait) => Event::ImageReady(portrait),
            Err(err) => Event::CaptureFailed(err.to_string()),
        };
        self.dispatch(event).await
    }

    pub async fn upload(&mut self, path: &Path) -> Vec<Notice> {
        if self.workflow.stage() != Stage::Capturing {
            return vec![Notice::Warning(
                "Step into the booth with `begin` before uploading a portrait.".to_string(),
            )];
        }
        match Portrait::from_file(path).await {
            Ok(portrait) => self.dispatch(Event::ImageReady(portrait)).await,
            Err(err) => vec![Notice::Error(err.to_string())],
        }
    }

    pub async fn settle(&mut self, completions: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Notice> {
        let mut notices = Vec::new();
        while self.workflow.is_busy() {
            match completions.recv().await {
                Some(event) => notices.extend(self.dispatch(event).await),
                None => break,
            }
        }
        notices
    }

    async fn run_effect(&mut self, effect: Effect, notices: &mut Vec<Notice>) {
        match effect {
            Effect::AcquireCamera => self.acquire_camera(notices),
            Effect::ReleaseCamera => {
                // dropping the guard closes the device
                self.camera = None;
            }
            Effect::Analyze { request, portrait } => {
                let backend = self.backend.clone();
                let completions = self.completions.clone();
                let handle = tokio::spawn(async move {
                    let event = match backend.analyze(&portrait).await {
                        Ok(text) => Event::AnalysisComplete { request, text },
                        Err(err) => {
                            warn!("Analysis {request} failed: {err}");
                            Event::AnalysisFailed {
                                request,
                                reason: err.to_string(),
                            }
                        }
                    };
                    let _ = completions.send(event);
                });
                self.track(request, handle);
            }
            Effect::Transform {
                request,
                portrait,
                target,
                analysis,
            } => {
                let backend = self.backend.clone();
                let completions = self.completions.clone();
                let handle = tokio::spawn(async move {
                    let event = match backend
                        .transform(&portrait, &target, analysis.as_deref())
                        .await
                    {
                        Ok(result) => Event::TransformComplete { request, result },
                        Err(err) => {
                            error!("Transformation {request} failed: {err}");
                            Event::TransformFailed {
                                request,
                                reason: err.to_string(),
                            }
                        }
                    };
                    let _ = completions.send(event);
                });
                self.track(request, handle);
            }
            Effect::SaveToGallery { data_url } => match self.gallery.save(data_url).await {
                Ok(saved) => notices.push(Notice::Info(format!(
                    "Portrait saved to the gallery ({}).",
                    saved.id
                ))),
                Err(err) => notices.push(Notice::Error(format!("Could not save portrait: {err}"))),
            },
            Effect::DeleteFromGallery { id } => match self.gallery.delete(&id).await {
                Ok(true) => notices.push(Notice::Info(format!("Deleted {id}."))),
                Ok(false) => notices.push(Notice::Info(format!("No saved portrait {id}."))),
                Err(err) => notices.push(Notice::Error(format!("Could not delete {id}: {err}"))),
            },
            Effect::Notify(notice) => notices.push(notice),
        }
    }

    fn track(&mut self, request: RequestId, handle: JoinHandle<()>) {
        if let Some((previous, task)) = self.in_flight.replace((request, handle)) {
            debug!("Aborting model call {previous}, superseded by {request}");
            task.abort();
        }
    }

    // the workflow forgets a request on reset, new capture or gallery; stop its task too
    fn cancel_abandoned(&mut self) {
        let pending = self.workflow.pending_request();
        if matches!(&self.in_flight, Some((request, _)) if Some(*request) != pending) {
            if let Some((request, task)) = self.in_flight.take() {
                if !task.is_finished() {
                    debug!("Aborting model call {request}, no longer pending");
                }
                task.abort();
            }
        }
    }

    fn acquire_camera(&mut self, notices: &mut Vec<Notice>) {
        let Some(factory) = self.camera_factory.as_mut() else {
            notices.push(Notice::Info(
                "No camera configured; upload a portrait file instead.".to_string(),
            ));
            return;
        };
        match factory() {
            Ok(camera) => self.camera = Some(camera),
            Err(err) => notices.push(Notice::Warning(format!(
                "{err}. You can still upload a portrait file."
            ))),
        }
    }
}
