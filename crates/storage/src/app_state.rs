//! Crisp Interview Assistant persisted state schema
//!
//! This module defines the slices the interview application persists and the
//! store configurations that persist them:
//!
//! - `interview`: the running session and its countdown timer
//! - `candidate`: the interviewer dashboard's candidate list and filters
//! - `ui`: tab selection, color mode and viewport
//!
//! # Schema Version
//!
//! The current schema version is [`SCHEMA_VERSION`]. Version 1 renamed
//! `candidate.candidates` to `candidate.list`; version 2 added
//! `candidate.filters`.

use crate::backend::StorageKind;
use crate::config::{self, PersistConfig};
use crate::migrate::MigrationTable;
use crate::persistence::PersistedState;
use crate::transform::{DerivedFields, StripFields, TransformRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Current persisted schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Durable store key
pub const ROOT_KEY: &str = "root";

/// Session store key
pub const SESSION_KEY: &str = "session";

/// Question difficulty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// Warm-up question
    #[default]
    Easy,
    /// Core question
    Medium,
    /// Stretch question
    Hard,
}

impl Difficulty {
    /// Time allowed to answer
    pub fn time_limit(self) -> Duration {
        match self {
            Difficulty::Easy => Duration::from_secs(20),
            Difficulty::Medium => Duration::from_secs(60),
            Difficulty::Hard => Duration::from_secs(120),
        }
    }

    /// Difficulty of each question in an interview, in order
    pub fn interview_plan() -> [Difficulty; 6] {
        [
            Difficulty::Easy,
            Difficulty::Easy,
            Difficulty::Medium,
            Difficulty::Medium,
            Difficulty::Hard,
            Difficulty::Hard,
        ]
    }
}

/// One question and the candidate's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRecord {
    /// Question text
    pub question: String,
    /// Difficulty
    pub difficulty: Difficulty,
    /// Submitted answer
    #[serde(default)]
    pub answer: Option<String>,
    /// Score assigned by the evaluator
    #[serde(default)]
    pub score: Option<u32>,
}

/// Live answer stream; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnswerStream {
    /// Whether the stream is open
    pub open: bool,
    /// Tokens received so far
    #[serde(default)]
    pub buffered: String,
}

/// Interview in progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterviewSession {
    /// Session ID
    pub id: String,
    /// Candidate being interviewed
    pub candidate_id: String,
    /// Index of the current question
    #[serde(default)]
    pub question_index: usize,
    /// Questions asked so far
    #[serde(default)]
    pub questions: Vec<QuestionRecord>,
    /// Live answer stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<AnswerStream>,
}

/// Question countdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    /// Milliseconds left on the current question
    pub remaining_ms: u64,
    /// Whether the countdown is paused
    #[serde(default)]
    pub paused: bool,
    /// Handle of the running tick task; meaningless after a restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<u64>,
}

impl TimerState {
    /// Fresh countdown for a question
    pub fn for_question(difficulty: Difficulty) -> Self {
        Self {
            remaining_ms: difficulty.time_limit().as_millis() as u64,
            paused: false,
            handle: None,
        }
    }

    /// Fraction of the time limit used, from 0 to 100
    pub fn percent_elapsed(&self, difficulty: Difficulty) -> u8 {
        let limit = difficulty.time_limit().as_millis() as u64;
        if limit == 0 {
            return 100;
        }
        let used = limit.saturating_sub(self.remaining_ms.min(limit));
        ((used * 100) / limit) as u8
    }
}

/// `interview` slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InterviewState {
    /// Session in progress
    #[serde(default)]
    pub current_session: Option<InterviewSession>,
    /// Countdown for the current question
    #[serde(default)]
    pub timer: TimerState,
}

/// Candidate row on the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSummary {
    /// Candidate ID
    pub id: String,
    /// Name from the resume
    pub name: String,
    /// Email from the resume
    #[serde(default)]
    pub email: Option<String>,
    /// Final interview score
    #[serde(default)]
    pub score: Option<u32>,
}

/// `candidate` slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CandidateState {
    /// Candidates, in the order they finished
    #[serde(default)]
    pub list: Vec<CandidateSummary>,
    /// Dashboard filters
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    /// Candidate open in the detail view
    #[serde(default)]
    pub selected_id: Option<String>,
}

/// Top-level tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    /// Candidate-facing chat
    #[default]
    Interviewee,
    /// Interviewer dashboard
    Interviewer,
}

/// Color mode preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// Follow system color scheme
    #[default]
    System,
    /// Always use light mode
    Light,
    /// Always use dark mode
    Dark,
}

/// Window dimensions; recomputed at rehydration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Whether the layout is the narrow one
    pub is_mobile: bool,
}

impl Viewport {
    /// Viewport of a window with the given size
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, is_mobile: width < 768 }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1280, 800)
    }
}

/// `ui` slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    /// Selected tab
    #[serde(default)]
    pub active_tab: Tab,
    /// Color mode preference
    #[serde(default)]
    pub color_mode: ColorMode,
    /// Current viewport
    #[serde(default)]
    pub viewport: Viewport,
    /// Open modals; never persisted
    #[serde(default)]
    pub modals: Vec<String>,
}

/// Whole application state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CrispState {
    /// `interview` slice
    #[serde(default)]
    pub interview: InterviewState,
    /// `candidate` slice
    #[serde(default)]
    pub candidate: CandidateState,
    /// `ui` slice
    #[serde(default)]
    pub ui: UiState,
}

impl CrispState {
    /// Rebuild application state from rehydrated slices.
    ///
    /// Missing or unreadable slices take their defaults.
    pub fn from_persisted(state: &PersistedState) -> Self {
        Self {
            interview: state.slice_as("interview").unwrap_or_default(),
            candidate: state.slice_as("candidate").unwrap_or_default(),
            ui: state.slice_as("ui").unwrap_or_default(),
        }
    }

    /// Whether an unfinished interview should be offered for resumption
    pub fn has_unfinished_interview(&self) -> bool {
        self.interview
            .current_session
            .as_ref()
            .is_some_and(|s| s.question_index < Difficulty::interview_plan().len())
    }
}

/// Schema migrations
pub fn crisp_migrations() -> MigrationTable {
    MigrationTable::new()
        .add(1, |mut state| {
            if let Some(candidate) = state.get_mut("candidate").and_then(Value::as_object_mut) {
                if let Some(list) = candidate.remove("candidates") {
                    candidate.insert("list".to_string(), list);
                }
            }
            Ok(state)
        })
        .add(2, |mut state| {
            if let Some(candidate) = state.get_mut("candidate").and_then(Value::as_object_mut) {
                candidate.entry("filters").or_insert_with(|| json!({}));
            }
            Ok(state)
        })
}

fn slice_defaults() -> BTreeMap<String, Value> {
    let defaults = serde_json::to_value(CrispState::default())
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    defaults.into_iter().collect()
}

fn crisp_transforms<F>(viewport: F) -> config::Result<TransformRegistry>
where
    F: Fn() -> Viewport + Send + Sync + 'static,
{
    let strip_timer = StripFields::new(["timer.handle"])?;
    let derive_viewport = DerivedFields::new("viewport", &["viewport"], move || {
        let mut fields = Map::new();
        if let Ok(value) = serde_json::to_value(viewport()) {
            fields.insert("viewport".to_string(), value);
        }
        fields
    });

    Ok(TransformRegistry::new()
        .add_for(&["interview"], strip_timer)
        .add_for(&["ui"], derive_viewport))
}

/// Durable store for the whole application.
///
/// `viewport` reports the current window size; it is consulted whenever the
/// `ui` slice is rehydrated.
pub fn crisp_persist_config<F>(viewport: F) -> config::Result<PersistConfig>
where
    F: Fn() -> Viewport + Send + Sync + 'static,
{
    let mut config = PersistConfig::new(ROOT_KEY)
        .storage(StorageKind::Local)
        .version(SCHEMA_VERSION)
        .whitelist(["interview", "candidate", "ui"])
        .blacklist(["interview.currentSession.stream", "ui.modals"])?
        .throttle(Duration::from_millis(1000))
        .migrations(crisp_migrations())
        .transforms(crisp_transforms(viewport)?);
    config.defaults = slice_defaults();
    Ok(config)
}

/// Per-session store for interview progress, written more often than the
/// durable store so the countdown survives a reload
pub fn session_persist_config() -> config::Result<PersistConfig> {
    let strip_timer = StripFields::new(["timer.handle"])?;

    Ok(PersistConfig::new(SESSION_KEY)
        .storage(StorageKind::Session)
        .version(SCHEMA_VERSION)
        .whitelist(["interview"])
        .blacklist(["interview.currentSession.stream"])?
        .throttle(Duration::from_millis(250))
        .transform(strip_timer))
}
