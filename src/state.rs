//! Application state: stores, evaluator, follow-up supplier, hub and catalog.
//!
//! This module owns:
//!   - the key-value cache and every store layered on it
//!   - the durable answer log
//!   - the evaluator (OpenAI when configured, local rubric otherwise)
//!   - the broadcast hub handle
//!   - the read-only survey catalog (TOML surveys + built-in seed)

use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::{info, instrument, warn};

use crate::answers::{AnswerLog, InMemoryAnswerLog};
use crate::attempts::AttemptTracker;
use crate::cache::KvCache;
use crate::config::{load_session_config_from_env, Settings};
use crate::domain::Survey;
use crate::error::{SessionError, SessionResult};
use crate::evaluator::{Evaluator, Evaluators, LocalEvaluator, OpenAiEvaluator};
use crate::followup::{FollowUpSupplier, GeneratorSource, PoolSource};
use crate::hub::Hub;
use crate::openai::OpenAI;
use crate::queue::QueueStore;
use crate::rooms::RoomStore;
use crate::scores::ScoreStore;
use crate::seeds::seed_surveys;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub surveys: Arc<HashMap<String, Survey>>,
    pub cache: Arc<KvCache>,
    pub rooms: RoomStore,
    pub queues: QueueStore,
    pub attempts: AttemptTracker,
    pub answers: Arc<dyn AnswerLog>,
    pub scores: ScoreStore,
    pub evaluators: Evaluators,
    pub pool: PoolSource,
    pub follow_ups: FollowUpSupplier,
    pub hub: Hub,
}

impl AppState {
    /// Build state from env: load config, index surveys, pick the evaluator, start the hub.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_session_config_from_env().unwrap_or_default();

        let evaluator: Arc<dyn Evaluator> = match OpenAI::from_env() {
            Some(oa) => {
                info!(target: "survey_live", base_url = %oa.base_url, fast_model = %oa.fast_model, strong_model = %oa.strong_model, "OpenAI evaluator enabled.");
                Arc::new(OpenAiEvaluator::new(oa, cfg.prompts.clone()))
            }
            None => {
                info!(target: "survey_live", "OpenAI disabled (no OPENAI_API_KEY). Using local rubric.");
                Arc::new(LocalEvaluator)
            }
        };

        Self::with_parts(cfg.session, cfg.surveys, evaluator)
    }

    /// Assemble state from explicit parts. Config surveys win over built-in ones with the same id.
    pub fn with_parts(settings: Settings, surveys: Vec<Survey>, evaluator: Arc<dyn Evaluator>) -> Self {
        let mut catalog: HashMap<String, Survey> = HashMap::new();
        for s in surveys {
            if s.questions.is_empty() {
                warn!(target: "survey_live", survey = %s.id, "Skipping survey without questions");
                continue;
            }
            catalog.insert(s.id.clone(), s);
        }
        for s in seed_surveys() {
            catalog.entry(s.id.clone()).or_insert(s);
        }
        for s in catalog.values() {
            info!(target: "survey_live", survey = %s.id, questions = s.questions.len(), "Survey available");
        }

        let cache = Arc::new(KvCache::new(Duration::from_secs(settings.room_ttl_secs)));
        let answers: Arc<dyn AnswerLog> = Arc::new(InMemoryAnswerLog::new());
        let evaluators = Evaluators::new(evaluator, Duration::from_millis(settings.evaluator_timeout_ms));
        let pool = PoolSource::new(cache.clone());
        let generator = GeneratorSource::new(
            evaluators.clone(),
            answers.clone(),
            cache.clone(),
            settings.follow_up_context_answers,
        );
        let follow_ups = FollowUpSupplier::new(vec![Arc::new(pool.clone()), Arc::new(generator)]);
        let hub = Hub::spawn(settings.outbound_buffer, settings.broadcast_inbox);

        Self {
            surveys: Arc::new(catalog),
            rooms: RoomStore::new(cache.clone()),
            queues: QueueStore::new(cache.clone()),
            attempts: AttemptTracker::new(cache.clone()),
            scores: ScoreStore::new(cache.clone()),
            cache,
            answers,
            evaluators,
            pool,
            follow_ups,
            hub,
            settings,
        }
    }

    pub fn survey(&self, id: &str) -> SessionResult<&Survey> {
        self.surveys.get(id).ok_or_else(|| SessionError::not_found("survey", id))
    }
}
