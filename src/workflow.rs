use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capture::Portrait;
use crate::era::Era;
use crate::llm::{TransformTarget, TransformationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Landing,
    Capturing,
    Analyzing,
    EraSelection,
    Generating,
    Result,
    Gallery,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Landing => "landing",
            Stage::Capturing => "capturing",
            Stage::Analyzing => "analyzing",
            Stage::EraSelection => "era-selection",
            Stage::Generating => "generating",
            Stage::Result => "result",
            Stage::Gallery => "gallery",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Begin,
    ImageReady(Portrait),
    CaptureFailed(String),
    AnalysisComplete {
        request: RequestId,
        text: String,
    },
    AnalysisFailed {
        request: RequestId,
        reason: String,
    },
    EraChosen(&'static Era),
    CustomPromptSubmitted(String),
    TransformComplete {
        request: RequestId,
        result: TransformationResult,
    },
    TransformFailed {
        request: RequestId,
        reason: String,
    },
    Refine(String),
    SaveResult,
    SaveSource,
    Reset,
    OpenGallery,
    DeleteSaved(String),
    Back,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::Begin => "begin",
            Event::ImageReady(_) => "image_ready",
            Event::CaptureFailed(_) => "capture_failed",
            Event::AnalysisComplete { .. } => "analysis_complete",
            Event::AnalysisFailed { .. } => "analysis_failed",
            Event::EraChosen(_) => "era_chosen",
            Event::CustomPromptSubmitted(_) => "custom_prompt",
            Event::TransformComplete { .. } => "transform_complete",
            Event::TransformFailed { .. } => "transform_failed",
            Event::Refine(_) => "refine",
            Event::SaveResult => "save_result",
            Event::SaveSource => "save_source",
            Event::Reset => "reset",
            Event::OpenGallery => "open_gallery",
            Event::DeleteSaved(_) => "delete_saved",
            Event::Back => "back",
        }
    }

    fn completion_request(&self) -> Option<RequestId> {
        match self {
            Event::AnalysisComplete { request, .. }
            | Event::AnalysisFailed { request, .. }
            | Event::TransformComplete { request, .. }
            | Event::TransformFailed { request, .. } => Some(*request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Warning(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub enum Effect {
    AcquireCamera,
    ReleaseCamera,
    Analyze {
        request: RequestId,
        portrait: Arc<Portrait>,
    },
    Transform {
        request: RequestId,
        portrait: Arc<Portrait>,
        target: TransformTarget,
        analysis: Option<String>,
    },
    SaveToGallery {
        data_url: String,
    },
    DeleteFromGallery {
        id: String,
    },
    Notify(Notice),
}

#[derive(Debug)]
pub struct Transition {
    pub stage: Stage,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Analyze,
    Transform,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    request: RequestId,
    kind: PendingKind,
}

#[derive(Debug)]
pub struct Workflow {
    stage: Stage,
    portrait: Option<Arc<Portrait>>,
    analysis: Option<String>,
    target: Option<TransformTarget>,
    result: Option<TransformationResult>,
    pending: Option<Pending>,
    next_request: u64,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    pub fn new() -> Self {
        Workflow {
            stage: Stage::Landing,
            portrait: None,
            analysis: None,
            target: None,
            result: None,
            pending: None,
            next_request: 1,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn portrait(&self) -> Option<&Arc<Portrait>> {
        self.portrait.as_ref()
    }

    pub fn analysis(&self) -> Option<&str> {
        self.analysis.as_deref()
    }

    pub fn target(&self) -> Option<&TransformTarget> {
        self.target.as_ref()
    }

    pub fn result(&self) -> Option<&TransformationResult> {
        self.result.as_ref()
    }

    pub fn pending_request(&self) -> Option<RequestId> {
        self.pending.map(|pending| pending.request)
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn handle(&mut self, event: Event) -> Transition {
        let from = self.stage;
        let name = event.name();
        let effects = self.apply(event);
        if from != self.stage {
            info!("Workflow {} --{}--> {}", from, name, self.stage);
        }
        debug_assert!(
            self.stage != Stage::Generating
                || (self.portrait.is_some()
                    && self.target.is_some()
                    && matches!(self.pending, Some(Pending { kind: PendingKind::Transform, .. })))
        );
        Transition {
            stage: self.stage,
            effects,
        }
    }

    fn apply(&mut self, event: Event) -> Vec<Effect> {
        match (self.stage, event) {
            (Stage::Landing, Event::Begin) => {
                self.stage = Stage::Capturing;
                vec![Effect::AcquireCamera]
            }

            (Stage::Capturing, Event::ImageReady(portrait)) => {
                self.clear_session();
                let portrait = Arc::new(portrait);
                self.portrait = Some(portrait.clone());
                let request = self.issue(PendingKind::Analyze);
                self.stage = Stage::Analyzing;
                vec![
                    Effect::ReleaseCamera,
                    Effect::Analyze { request, portrait },
                ]
            }
            (Stage::Capturing, Event::CaptureFailed(reason)) => {
                self.stage = Stage::Landing;
                vec![
                    Effect::ReleaseCamera,
                    Effect::Notify(Notice::Error(format!("Capture failed: {reason}"))),
                ]
            }
            (Stage::Capturing, Event::Back) => {
                self.stage = Stage::Landing;
                vec![Effect::ReleaseCamera]
            }

            (Stage::Analyzing, Event::AnalysisComplete { request, text })
                if self.is_pending(request, PendingKind::Analyze) =>
            {
                self.pending = None;
                let text = text.trim();
                self.analysis = (!text.is_empty()).then(|| text.to_string());
                self.stage = Stage::EraSelection;
                Vec::new()
            }
            (Stage::Analyzing, Event::AnalysisFailed { request, reason })
                if self.is_pending(request, PendingKind::Analyze) =>
            {
                self.pending = None;
                self.analysis = None;
                self.stage = Stage::EraSelection;
                warn!("Analysis {request} failed, continuing without it: {reason}");
                vec![Effect::Notify(Notice::Warning(
                    "Portrait analysis is unavailable; continuing without it.".to_string(),
                ))]
            }

            (Stage::EraSelection, Event::EraChosen(era)) => {
                self.start_transform(TransformTarget::Era(era))
            }
            (Stage::EraSelection, Event::CustomPromptSubmitted(prompt))
            | (Stage::Result, Event::Refine(prompt)) => {
                let prompt = prompt.trim();
                if prompt.is_empty() {
                    return vec![Effect::Notify(Notice::Warning(
                        "Enter a prompt first.".to_string(),
                    ))];
                }
                self.start_transform(TransformTarget::Custom(prompt.to_string()))
            }

            (Stage::Generating, Event::TransformComplete { request, result })
                if self.is_pending(request, PendingKind::Transform) =>
            {
                self.pending = None;
                if result.is_empty() {
                    return self.fail_transform("the model returned nothing");
                }
                self.result = Some(result);
                self.stage = Stage::Result;
                Vec::new()
            }
            (Stage::Generating, Event::TransformFailed { request, reason })
                if self.is_pending(request, PendingKind::Transform) =>
            {
                self.pending = None;
                self.fail_transform(&reason)
            }

            (Stage::Result, Event::SaveResult) => {
                match self.result.as_ref().and_then(|result| result.image.as_ref()) {
                    Some(image) => vec![Effect::SaveToGallery {
                        data_url: image.to_data_url(),
                    }],
                    None => vec![Effect::Notify(Notice::Warning(
                        "Only a text description was returned; there is no image to save."
                            .to_string(),
                    ))],
                }
            }
            (Stage::EraSelection | Stage::Result, Event::SaveSource) => match &self.portrait {
                Some(portrait) => vec![Effect::SaveToGallery {
                    data_url: portrait.to_data_url(),
                }],
                None => Vec::new(),
            },

            (
                Stage::Analyzing | Stage::EraSelection | Stage::Generating | Stage::Result,
                Event::Reset,
            ) => {
                self.clear_session();
                self.stage = Stage::Landing;
                Vec::new()
            }

            (Stage::Gallery, Event::OpenGallery) => Vec::new(),
            (stage, Event::OpenGallery) => {
                let mut effects = Vec::new();
                if stage == Stage::Capturing {
                    effects.push(Effect::ReleaseCamera);
                }
                if let Some(pending) = self.pending.take() {
                    info!("Abandoning request {} on the way to the gallery", pending.request);
                }
                self.stage = Stage::Gallery;
                effects
            }
            (Stage::Gallery, Event::DeleteSaved(id)) => vec![Effect::DeleteFromGallery { id }],
            (Stage::Gallery, Event::Back) => {
                self.stage = Stage::Landing;
                Vec::new()
            }

            (stage, event) => {
                match event.completion_request() {
                    Some(request) => debug!(
                        "Discarding stale {} for request {request} (stage={stage}, pending={:?})",
                        event.name(),
                        self.pending_request()
                    ),
                    None => debug!("Ignoring {} in stage {stage}", event.name()),
                }
                Vec::new()
            }
        }
    }

    fn is_pending(&self, request: RequestId, kind: PendingKind) -> bool {
        matches!(self.pending, Some(pending) if pending.request == request && pending.kind == kind)
    }

    fn issue(&mut self, kind: PendingKind) -> RequestId {
        let request = RequestId(self.next_request);
        self.next_request += 1;
        self.pending = Some(Pending { request, kind });
        request
    }

    fn start_transform(&mut self, target: TransformTarget) -> Vec<Effect> {
        let Some(portrait) = self.portrait.clone() else {
            warn!("Transform requested without a portrait; ignoring");
            return vec![Effect::Notify(Notice::Error(
                "Capture a portrait first.".to_string(),
            ))];
        };
        self.result = None;
        self.target = Some(target.clone());
        let request = self.issue(PendingKind::Transform);
        self.stage = Stage::Generating;
        vec![Effect::Transform {
            request,
            portrait,
            target,
            analysis: self.analysis.clone(),
        }]
    }

    fn fail_transform(&mut self, reason: &str) -> Vec<Effect> {
        self.stage = Stage::EraSelection;
        warn!("Transformation failed: {reason}");
        vec![Effect::Notify(Notice::Error(format!(
            "Generation failed: {reason}. Please try again."
        )))]
    }

    fn clear_session(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Dropping pending request {}", pending.request);
        }
        self.portrait = None;
        self.analysis = None;
        self.target = None;
        self.result = None;
    }
}
